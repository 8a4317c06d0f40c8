//! Captured child output.

use super::error::ProcessError;
use std::fmt;

/// How undecodable bytes are handled in text mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrors {
    /// Invalid UTF-8 is a [`ProcessError::Decode`].
    #[default]
    Strict,
    /// Invalid sequences become U+FFFD.
    Replace,
}

/// Output of one stream, raw or decoded depending on the text mode of the
/// command that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamData {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// UTF-8 text with line endings normalized to `\n`.
    Text(String),
}

impl StreamData {
    /// The data as bytes, whichever form it is in.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// The decoded text, if this is text-mode output.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Bytes(_) => None,
            Self::Text(text) => Some(text),
        }
    }

    /// Consumes the data into bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }

    /// Consumes the data into a string, replacing invalid UTF-8.
    #[must_use]
    pub fn into_string_lossy(self) -> String {
        match self {
            Self::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Self::Text(text) => text,
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StreamData {
    fn default() -> Self {
        Self::Bytes(Vec::new())
    }
}

impl fmt::Display for StreamData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Result of [`Child::communicate`](super::Child::communicate).
///
/// A field is `None` when the corresponding stream was not a pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Communicated {
    /// Everything the child wrote to stdout.
    pub stdout: Option<StreamData>,
    /// Everything the child wrote to stderr.
    pub stderr: Option<StreamData>,
}

/// Turns accumulated bytes into [`StreamData`].
///
/// With `text` set the bytes are decoded as UTF-8 and `\r\n` / lone `\r`
/// become `\n`.
pub(crate) fn finish_stream(
    data: Vec<u8>,
    text: Option<DecodeErrors>,
) -> Result<StreamData, ProcessError> {
    match text {
        Some(errors) => decode_text(data, errors).map(StreamData::Text),
        None => Ok(StreamData::Bytes(data)),
    }
}

/// Decodes `data` as UTF-8 under `errors` and normalizes line endings.
pub(crate) fn decode_text(data: Vec<u8>, errors: DecodeErrors) -> Result<String, ProcessError> {
    let decoded = match errors {
        DecodeErrors::Strict => {
            String::from_utf8(data).map_err(|err| ProcessError::Decode(err.to_string()))?
        }
        DecodeErrors::Replace => match String::from_utf8(data) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        },
    };
    Ok(translate_newlines(decoded))
}

fn translate_newlines(text: String) -> String {
    if !text.contains('\r') {
        return text;
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}
