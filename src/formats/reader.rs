use anyhow::Result;
use encoding_rs::Encoding;
use serde::Deserialize;

/// A single row from the input file, split into its text cells
///
/// Cell positions follow the source file's column order, not the schema's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub cells: Vec<String>,
}

impl RawRow {
    /// Split one complete line of text on the cell delimiter
    pub fn from_line(line: &str, cell_delimiter: &str) -> Self {
        Self {
            cells: line.split(cell_delimiter).map(str::to_string).collect(),
        }
    }

    /// Join the cells back into one line of text
    pub fn to_line(&self, cell_delimiter: &str) -> String {
        self.cells.join(cell_delimiter)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for RawRow {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// What the chunk reader does with a buffer it cannot decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// Drop the buffer and the cached partial row, log, and keep reading
    #[default]
    Skip,
    /// End the stream with the decode error
    FailFast,
}

impl DecodePolicy {
    /// Parse policy from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(DecodePolicy::Skip),
            "fail-fast" | "fail_fast" | "failfast" => Ok(DecodePolicy::FailFast),
            _ => Err(anyhow::anyhow!(
                "Unsupported decode policy: {}. Supported policies: skip, fail-fast",
                s
            )),
        }
    }
}

/// Dialect of the input file
#[derive(Debug, Clone)]
pub struct InputFileConfig {
    pub encoding: &'static Encoding,
    pub has_header_row: bool,
    pub row_delimiter: String,
    pub cell_delimiter: String,
}

impl InputFileConfig {
    /// Create from string representations, resolving the encoding label
    pub fn from_strings(
        encoding: &str,
        has_header_row: bool,
        row_delimiter: &str,
        cell_delimiter: &str,
    ) -> Result<Self> {
        let encoding = Encoding::for_label(encoding.trim().as_bytes())
            .ok_or_else(|| anyhow::anyhow!("Unknown file encoding: '{}'", encoding))?;

        if row_delimiter.is_empty() {
            anyhow::bail!("Row delimiter must not be empty");
        }
        if cell_delimiter.is_empty() {
            anyhow::bail!("Cell delimiter must not be empty");
        }
        if row_delimiter == cell_delimiter {
            anyhow::bail!(
                "Row and cell delimiters must differ (both are {:?})",
                row_delimiter
            );
        }

        Ok(Self {
            encoding,
            has_header_row,
            row_delimiter: row_delimiter.to_string(),
            cell_delimiter: cell_delimiter.to_string(),
        })
    }

    pub fn csv() -> Self {
        Self::default()
    }
}

impl Default for InputFileConfig {
    fn default() -> Self {
        Self {
            encoding: encoding_rs::UTF_8,
            has_header_row: true,
            row_delimiter: "\n".to_string(),
            cell_delimiter: ",".to_string(),
        }
    }
}

/// `file` section of the model file (JSON serialization format)
#[derive(Debug, Clone, Deserialize)]
pub struct InputFileConfigJson {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_has_header_row")]
    pub has_header_row: bool,
    #[serde(default = "default_row_delimiter")]
    pub row_delimiter: String,
    #[serde(default = "default_cell_delimiter")]
    pub cell_delimiter: String,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_has_header_row() -> bool {
    true
}

fn default_row_delimiter() -> String {
    "\n".to_string()
}

fn default_cell_delimiter() -> String {
    ",".to_string()
}

impl Default for InputFileConfigJson {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            has_header_row: default_has_header_row(),
            row_delimiter: default_row_delimiter(),
            cell_delimiter: default_cell_delimiter(),
        }
    }
}

impl TryFrom<InputFileConfigJson> for InputFileConfig {
    type Error = anyhow::Error;

    fn try_from(json: InputFileConfigJson) -> Result<Self> {
        InputFileConfig::from_strings(
            &json.encoding,
            json.has_header_row,
            &json.row_delimiter,
            &json.cell_delimiter,
        )
    }
}
