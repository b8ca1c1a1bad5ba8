use std::io::BufRead;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use super::TextChunks;

/// `data:` payloads of a server-sent event stream, ending at EOF or `[DONE]`.
pub(crate) struct SseData<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseData<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseData<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    let Some(data) = trimmed.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim_start();
                    if data == "[DONE]" {
                        self.done = true;
                        return None;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    return Some(Ok(data.to_string()));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(anyhow!(err).context("stream read failed")));
                }
            }
        }
    }
}

/// Decodes each event as JSON and keeps the text deltas `extract` finds.
pub(crate) fn text_chunks<R>(
    reader: R,
    provider: &'static str,
    extract: fn(&Value) -> Result<Option<String>>,
) -> TextChunks
where
    R: BufRead + Send + 'static,
{
    Box::new(SseData::new(reader).filter_map(move |item| {
        let data = match item {
            Ok(data) => data,
            Err(err) => return Some(Err(err)),
        };
        let parsed = serde_json::from_str::<Value>(&data)
            .with_context(|| format!("{provider} sent an invalid stream event"));
        match parsed {
            Ok(event) => extract(&event).transpose(),
            Err(err) => Some(Err(err)),
        }
    }))
}
