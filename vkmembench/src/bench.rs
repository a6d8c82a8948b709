use std::sync::Arc;

use eyre::WrapErr;
use vkmem::bandwidth::{BYTES_PER_MIB, BandwidthProbe, Throughput};
use vkmem::device::DeviceContext;

pub const COPY_HEADER: &str = "host-to-device copy (compute queue)";

/// Power-of-two sizes in MiB from `min_mib` through `max_mib`.
///
/// `min_mib` is rounded up to a power of two. Empty when `min_mib` is
/// zero or larger than `max_mib`.
pub fn sweep_sizes(min_mib: u64, max_mib: u64) -> Vec<u64> {
    if min_mib == 0 || min_mib > max_mib {
        return Vec::new();
    }
    let Some(first) = min_mib.checked_next_power_of_two() else {
        return Vec::new();
    };
    std::iter::successors(Some(first), |&mib| mib.checked_mul(2))
        .take_while(|&mib| mib <= max_mib)
        .collect()
}

/// `"<N> MiB @ <X> MiB/sec"` with one decimal, or `n/a` when no device
/// time was recorded.
pub fn report_line(size_mib: u64, throughput: &Throughput) -> String {
    match throughput.mib_per_second() {
        Some(rate) => format!("{size_mib} MiB @ {rate:.1} MiB/sec"),
        None => format!("{size_mib} MiB @ n/a MiB/sec"),
    }
}

pub fn header() -> String {
    format!("{COPY_HEADER}\n{}", "-".repeat(20))
}

/// Time one probe per size and print a report line as each finishes.
pub fn run_copy_sweep(
    ctx: &Arc<DeviceContext>,
    sizes_mib: &[u64],
) -> eyre::Result<Vec<(u64, Throughput)>> {
    println!("{}", header());

    let mut results = Vec::with_capacity(sizes_mib.len());
    for &size_mib in sizes_mib {
        let _span = tracing::info_span!("copy_sweep", size_mib).entered();
        let size = size_mib
            .checked_mul(BYTES_PER_MIB)
            .ok_or_else(|| eyre::eyre!("{size_mib} MiB overflows a device size"))?;

        let mut probe = BandwidthProbe::new(ctx, size)
            .wrap_err_with(|| format!("Setting up {size_mib} MiB copy probe"))?;
        let throughput = probe
            .measure()
            .wrap_err_with(|| format!("Measuring {size_mib} MiB copy"))?;
        tracing::debug!(
            total_bytes = throughput.total_bytes(),
            total_seconds = throughput.total_seconds(),
            "copy probe finished"
        );

        println!("{}", report_line(size_mib, &throughput));
        results.push((size_mib, throughput));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sweep_is_eleven_sizes() {
        let sizes = sweep_sizes(1, 1024);
        assert_eq!(sizes.len(), 11);
        assert_eq!(sizes.first(), Some(&1));
        assert_eq!(sizes.last(), Some(&1024));
        assert!(sizes.windows(2).all(|w| w[1] == w[0] * 2));
    }

    #[test]
    fn non_power_of_two_bounds() {
        assert_eq!(sweep_sizes(3, 40), vec![4, 8, 16, 32]);
    }

    #[test]
    fn single_size_sweep() {
        assert_eq!(sweep_sizes(64, 64), vec![64]);
    }

    #[test]
    fn degenerate_sweeps_are_empty() {
        assert!(sweep_sizes(0, 16).is_empty());
        assert!(sweep_sizes(32, 16).is_empty());
        assert!(sweep_sizes(u64::MAX, u64::MAX).is_empty());
    }

    #[test]
    fn sweep_stops_before_overflow() {
        let sizes = sweep_sizes(1 << 62, u64::MAX);
        assert_eq!(sizes, vec![1 << 62, 1 << 63]);
    }

    #[test]
    fn report_line_format() {
        let mut t = Throughput::default();
        t.record_sample(BYTES_PER_MIB, 0.5);
        assert_eq!(report_line(1, &t), "1 MiB @ 2.0 MiB/sec");
    }

    #[test]
    fn report_line_rounds_to_one_decimal() {
        let mut t = Throughput::default();
        t.record_sample(1024 * BYTES_PER_MIB, 0.1);
        t.record_sample(1024 * BYTES_PER_MIB, 0.2);
        assert_eq!(report_line(1024, &t), "1024 MiB @ 6826.7 MiB/sec");
    }

    #[test]
    fn report_line_without_time() {
        assert_eq!(
            report_line(8, &Throughput::default()),
            "8 MiB @ n/a MiB/sec"
        );
    }

    #[test]
    fn header_has_underline() {
        assert_eq!(
            header(),
            "host-to-device copy (compute queue)\n--------------------"
        );
    }
}
