use std::io::Write;

use crate::mtu::MtuReport;

/// Generate a plain text summary of an analysis
pub fn generate_report<W: Write>(report: &MtuReport, mut writer: W) -> std::io::Result<()> {
    writeln!(
        writer,
        "ipsecmtu report for {} (from {}, {:?} probes)",
        report.destination, report.source, report.protocol
    )?;
    writeln!(writer)?;

    writeln!(
        writer,
        "{:>4}  {:>6} {:>6} {:>6} {:>6}  {}",
        "Pass", "Start", "Step", "Sent", "MTU", "Largest acknowledged"
    )?;
    writeln!(writer, "{}", "-".repeat(60))?;

    for pass in &report.passes {
        let largest = pass
            .probes
            .iter()
            .filter(|p| p.acknowledged)
            .map(|p| p.size)
            .max()
            .map_or_else(|| "-".to_string(), |size| size.to_string());
        let failed = pass.probes.iter().filter(|p| p.send_failed).count();

        write!(
            writer,
            "{:>4}  {:>6} {:>6} {:>6} {:>6}  {}",
            pass.pass,
            pass.start_mtu,
            pass.increment,
            pass.probes.len(),
            pass.mtu,
            largest
        )?;
        if failed > 0 {
            write!(writer, " ({} send failures)", failed)?;
        }
        writeln!(writer)?;
    }
    writeln!(writer)?;

    let stats = &report.capture;
    writeln!(
        writer,
        "Captured: {} frames ({} ESP, {} ICMPv4, {} other), dropped {} ESP / {} ICMPv4",
        stats.frames, stats.esp, stats.icmp, stats.other, stats.dropped_esp, stats.dropped_icmp
    )?;
    if stats.read_errors > 0 {
        writeln!(writer, "Read errors: {}", stats.read_errors)?;
    }

    if report.mtu == 0 {
        writeln!(writer, "MTU: no probe was acknowledged")?;
    } else {
        writeln!(writer, "MTU: {}", report.mtu)?;
    }

    Ok(())
}
