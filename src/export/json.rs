use std::io::Write;

use crate::mtu::MtuReport;

/// Write the report as pretty-printed JSON
pub fn export_json<W: Write>(report: &MtuReport, mut writer: W) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    Ok(())
}
