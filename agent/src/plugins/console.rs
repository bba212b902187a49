// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Console reporter: JSON lines on stdout.

use concurrency::CancelToken;
use plugin::{BatchReport, ConfigMap, OutputPacket, Plugin, PluginError, Reporter};
use std::io::Write;

/// Writes one JSON object per record to stdout. Mostly useful as a fallback
/// sink and for local debugging.
#[derive(Default)]
pub struct ConsoleReporter {
    pretty: bool,
}

impl ConsoleReporter {
    fn write_one(&self, pkt: &OutputPacket) -> Result<(), PluginError> {
        let line = if self.pretty {
            serde_json::to_string_pretty(pkt)
        } else {
            serde_json::to_string(pkt)
        }
        .map_err(|e| PluginError::Failed(format!("record encoding: {e}")))?;
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        writeln!(lock, "{line}")?;
        Ok(())
    }
}

impl Plugin for ConsoleReporter {
    fn name(&self) -> &'static str {
        "console"
    }

    fn init(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        self.pretty = cfg
            .get("pretty")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Ok(())
    }
}

impl Reporter for ConsoleReporter {
    fn report(&mut self, _cancel: &CancelToken, pkt: &OutputPacket) -> Result<(), PluginError> {
        self.write_one(pkt)
    }

    fn flush(&mut self, _cancel: &CancelToken) -> Result<(), PluginError> {
        std::io::stdout().flush()?;
        Ok(())
    }

    fn as_batch(&mut self) -> Option<&mut dyn BatchReport> {
        Some(self)
    }
}

impl BatchReport for ConsoleReporter {
    fn report_batch(
        &mut self,
        _cancel: &CancelToken,
        packets: &[OutputPacket],
    ) -> Result<(), PluginError> {
        for pkt in packets {
            self.write_one(pkt)?;
        }
        Ok(())
    }
}
