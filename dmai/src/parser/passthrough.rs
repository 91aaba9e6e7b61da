// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Parser for streams whose upstream already delivers whole frames.

use super::{Accumulator, StreamConfig, StreamParser};
use crate::Result;
use crate::sync::FlushFlag;

pub struct PassthroughParser {
    flushing: FlushFlag,
}

impl PassthroughParser {
    pub fn new(flushing: FlushFlag) -> Self {
        Self { flushing }
    }
}

impl StreamParser for PassthroughParser {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn init(&mut self, _config: &StreamConfig) -> Result<()> {
        Ok(())
    }

    fn parse(&mut self, acc: &mut Accumulator) -> Option<usize> {
        (!self.flushing.is_raised() && !acc.is_empty()).then(|| acc.len())
    }

    fn flush_start(&mut self) {
        self.flushing.raise();
    }

    fn flush_stop(&mut self) {
        self.flushing.clear();
    }

    fn clean(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_everything_then_sentinel() {
        let mut parser = PassthroughParser::new(FlushFlag::new());
        let mut acc = Accumulator::new();
        assert_eq!(parser.parse(&mut acc), None);

        acc.push(&[1, 2, 3, 4]);
        assert_eq!(parser.parse(&mut acc), Some(4));
        assert_eq!(parser.drain(&mut acc), 4);
        acc.take(4);
        assert_eq!(parser.drain(&mut acc), 0);
    }
}
