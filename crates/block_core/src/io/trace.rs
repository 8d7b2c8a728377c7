use std::io::Write;

use serde::Serialize;

use crate::events::Event;

/// One line of a run trace: a sequence number plus the event's own fields.
#[derive(Clone, Debug, Serialize)]
pub struct TraceLine<'a> {
    pub seq: u64,
    #[serde(flatten)]
    pub event: &'a Event,
}

impl TraceLine<'_> {
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// Writes events as newline-delimited JSON, numbering them from zero.
#[derive(Debug)]
pub struct TraceWriter<W> {
    out: W,
    next_seq: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, next_seq: 0 }
    }

    pub fn record(&mut self, event: &Event) -> anyhow::Result<()> {
        let line = TraceLine {
            seq: self.next_seq,
            event,
        };
        self.out.write_all(line.to_ndjson()?.as_bytes())?;
        self.next_seq += 1;
        Ok(())
    }

    pub fn record_all<'e>(&mut self, events: impl IntoIterator<Item = &'e Event>) -> anyhow::Result<()> {
        for event in events {
            self.record(event)?;
        }
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.next_seq
    }

    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
