use std::fs;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::info;

use crate::error::Error;

/// Source of the bytes handed to admitted clients.
pub trait PayloadProvider: Send + Sync {
    fn payload(&self) -> Vec<u8>;
}

impl<F> PayloadProvider for F
where
    F: Fn() -> Vec<u8> + Send + Sync,
{
    fn payload(&self) -> Vec<u8> {
        self()
    }
}

/// Newline separated quotes, one picked at random per call.
#[derive(Debug, Clone)]
pub struct Quotes {
    lines: Arc<[Vec<u8>]>,
}

impl Quotes {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read(path)?;
        let quotes = Self::from_bytes(&raw).map_err(|_| {
            Error::InvalidConfig(format!("quotes file {} has no quotes", path.display()))
        })?;
        info!(path = %path.display(), count = quotes.len(), "loaded quotes");
        Ok(quotes)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, Error> {
        let lines: Vec<Vec<u8>> = raw
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(<[u8]>::to_vec)
            .collect();
        if lines.is_empty() {
            return Err(Error::InvalidConfig("no quotes".into()));
        }
        Ok(Self {
            lines: lines.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl PayloadProvider for Quotes {
    fn payload(&self) -> Vec<u8> {
        self.lines
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }
}
