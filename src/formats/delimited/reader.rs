use anyhow::Result;
use async_stream::try_stream;
use encoding_rs::{Decoder, DecoderResult, Encoding, UTF_16BE, UTF_16LE};
use futures::stream::BoxStream;
use tracing::{Span, debug, warn};

use crate::error::DecodeError;
use crate::formats::reader::{DecodePolicy, InputFileConfig, RawRow};
use crate::io::{ByteReader, read_full};

/// Streams batches of complete rows out of a delimited file
///
/// Rows are reassembled across buffer boundaries: the text after the last row
/// delimiter of a buffer is cached and prepended to the next one. The header
/// row, if configured, is dropped exactly once.
pub struct ChunkReader<R: ByteReader> {
    reader: R,
    config: InputFileConfig,
    chunk_size_bytes: usize,
    decode_policy: DecodePolicy,
    span: Span,
}

impl<R: ByteReader + 'static> ChunkReader<R> {
    pub fn new(
        reader: R,
        config: InputFileConfig,
        chunk_size_bytes: usize,
        decode_policy: DecodePolicy,
        span: Span,
    ) -> Self {
        Self {
            reader,
            config,
            chunk_size_bytes: chunk_size_bytes.max(1),
            decode_policy,
            span,
        }
    }

    /// Consume the reader, yielding one batch of rows per buffer read
    ///
    /// The stream ends after the final cached row. Under
    /// [`DecodePolicy::Skip`] an undecodable buffer yields an empty batch, and
    /// reading resumes after the next row delimiter so that the rest of the
    /// broken row and any character split off the dropped buffer are skipped.
    pub fn read_rows_in_chunks(self) -> BoxStream<'static, Result<Vec<RawRow>>> {
        let Self {
            mut reader,
            config,
            chunk_size_bytes,
            decode_policy,
            span,
        } = self;

        Box::pin(try_stream! {
            let encoding = config.encoding;
            let delimiter_bytes = encoded_delimiter(encoding, &config.row_delimiter);
            let mut decoder = encoding.new_decoder_with_bom_removal();
            let mut assembler = RowAssembler::new(&config);
            let mut offset = 0u64;
            let mut resyncing = false;

            let total_bytes = reader.size().await?;
            debug!(parent: &span, total_bytes, chunk_size_bytes, "reading input");

            loop {
                let buffer = read_full(&mut reader, chunk_size_bytes).await?;
                let at_end = buffer.is_empty();

                let mut bytes = &buffer[..];
                if resyncing {
                    // Everything up to the next row delimiter belongs to the dropped row
                    bytes = match delimiter_bytes
                        .as_deref()
                        .and_then(|delimiter| skip_past(bytes, delimiter))
                    {
                        Some(rest) => {
                            resyncing = false;
                            rest
                        }
                        None => &[],
                    };
                }

                match decode_chunk(&mut decoder, bytes, at_end) {
                    Some(text) => {
                        let rows = assembler.push(&text);
                        debug!(parent: &span, offset, rows = rows.len(), "decoded chunk");
                        if !rows.is_empty() {
                            yield rows;
                        }
                    }
                    None => {
                        let error = DecodeError {
                            encoding: encoding.name(),
                            offset,
                        };
                        match decode_policy {
                            DecodePolicy::FailFast => Err::<(), _>(error)?,
                            DecodePolicy::Skip => {
                                warn!(
                                    parent: &span,
                                    %error,
                                    bytes = buffer.len(),
                                    "dropping undecodable chunk and its cached partial row"
                                );
                                assembler.discard_tail();
                                decoder = encoding.new_decoder_without_bom_handling();
                                resyncing = delimiter_bytes.is_some();
                                yield Vec::new();
                            }
                        }
                    }
                }

                if at_end {
                    break;
                }
                offset += buffer.len() as u64;
            }

            if let Some(last_row) = assembler.finish() {
                yield vec![last_row];
            }
        })
    }
}

/// Row delimiter as it appears in the raw input bytes
///
/// `None` when the delimiter cannot be represented in `encoding`.
fn encoded_delimiter(encoding: &'static Encoding, delimiter: &str) -> Option<Vec<u8>> {
    if encoding == UTF_16LE {
        return Some(delimiter.encode_utf16().flat_map(u16::to_le_bytes).collect());
    }
    if encoding == UTF_16BE {
        return Some(delimiter.encode_utf16().flat_map(u16::to_be_bytes).collect());
    }

    let (bytes, output_encoding, had_errors) = encoding.encode(delimiter);
    (output_encoding == encoding && !had_errors && !bytes.is_empty()).then(|| bytes.into_owned())
}

/// Bytes after the first occurrence of `delimiter`, if there is one
fn skip_past<'a>(bytes: &'a [u8], delimiter: &[u8]) -> Option<&'a [u8]> {
    bytes
        .windows(delimiter.len())
        .position(|window| window == delimiter)
        .map(|start| &bytes[start + delimiter.len()..])
}

/// Decode one buffer, carrying incomplete multi-byte sequences in the decoder
fn decode_chunk(decoder: &mut Decoder, bytes: &[u8], last: bool) -> Option<String> {
    let capacity = decoder
        .max_utf8_buffer_length_without_replacement(bytes.len())
        .unwrap_or(bytes.len().saturating_mul(3));
    let mut text = String::with_capacity(capacity);
    let mut consumed = 0;

    loop {
        let (result, read) =
            decoder.decode_to_string_without_replacement(&bytes[consumed..], &mut text, last);
        consumed += read;

        match result {
            DecoderResult::InputEmpty => return Some(text),
            DecoderResult::OutputFull => text.reserve(bytes.len() - consumed + 16),
            DecoderResult::Malformed(_, _) => return None,
        }
    }
}

/// Splits decoded text into rows, caching the incomplete trailing row
struct RowAssembler {
    row_delimiter: String,
    cell_delimiter: String,
    header_pending: bool,
    tail: String,
}

impl RowAssembler {
    fn new(config: &InputFileConfig) -> Self {
        Self {
            row_delimiter: config.row_delimiter.clone(),
            cell_delimiter: config.cell_delimiter.clone(),
            header_pending: config.has_header_row,
            tail: String::new(),
        }
    }

    /// Append decoded text and return every row it completes
    fn push(&mut self, text: &str) -> Vec<RawRow> {
        let mut buffered = std::mem::take(&mut self.tail);
        buffered.push_str(text);

        let Some(last_delimiter) = buffered.rfind(&self.row_delimiter) else {
            self.tail = buffered;
            return Vec::new();
        };

        self.tail = buffered[last_delimiter + self.row_delimiter.len()..].to_string();

        let mut lines = buffered[..last_delimiter].split(&self.row_delimiter);
        if self.header_pending {
            lines.next();
            self.header_pending = false;
        }

        lines
            .map(|line| RawRow::from_line(line, &self.cell_delimiter))
            .collect()
    }

    /// Drop the cached partial row; the header, if still pending, went with it
    fn discard_tail(&mut self) {
        self.tail.clear();
        self.header_pending = false;
    }

    /// Emit the cached tail as the final row, if any
    fn finish(mut self) -> Option<RawRow> {
        if self.tail.is_empty() {
            return None;
        }
        if self.header_pending {
            self.header_pending = false;
            return None;
        }
        Some(RawRow::from_line(&self.tail, &self.cell_delimiter))
    }
}
