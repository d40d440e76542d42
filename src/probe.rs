//! Free-GPU discovery.
//!
//! A small POSIX shell script is shipped to each node, run once per
//! connection attempt, and deleted afterwards. Its stdout contract is a
//! single line:
//!
//! ```text
//! [[GPU INFO]] [0,1,3] Free
//! ```
//!
//! A host without `nvidia-smi` reports an empty list, which callers treat
//! as "no capacity", not as an error worth retrying.

use crate::events::GPU_INFO_MARKER;

/// Probe script. Takes the minimum free VRAM (MiB) and the maximum
/// utilization (percent) as positional arguments.
pub const PROBE_SCRIPT: &str = r#"#!/bin/sh
min_vram_mib="${1:-10240}"
max_util_pct="${2:-10}"
if ! command -v nvidia-smi >/dev/null 2>&1; then
    echo "[[GPU INFO]] [] Free"
    exit 0
fi
free=$(nvidia-smi --query-gpu=index,memory.free,utilization.gpu \
        --format=csv,noheader,nounits \
    | awk -F', *' -v vram="$min_vram_mib" -v util="$max_util_pct" \
        '$2 + 0 >= vram && $3 + 0 <= util { printf "%s%s", sep, $1; sep="," }')
echo "[[GPU INFO]] [$free] Free"
"#;

/// Node-unique remote path for the probe script. Includes the local
/// process id so concurrent sweeps against the same host cannot clobber
/// each other's copy.
pub fn remote_script_path(node_name: &str) -> String {
    let sanitized: String = node_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("/tmp/gridsweep_probe_{}_{}.sh", sanitized, std::process::id())
}

/// Extracts the free GPU indices from probe output. Scans all lines for
/// the marker so stray shell noise ahead of it is harmless. Returns `None`
/// when no line carries a well-formed marker.
pub fn parse_gpu_info(output: &str) -> Option<Vec<u32>> {
    for line in output.lines() {
        let rest = match line.split_once(GPU_INFO_MARKER) {
            Some((_, rest)) => rest,
            None => continue,
        };
        let open = rest.find('[')?;
        let close = rest[open..].find(']')? + open;
        let inner = rest[open + 1..close].trim();
        if inner.is_empty() {
            return Some(Vec::new());
        }
        let mut gpus = Vec::new();
        for part in inner.split(',') {
            match part.trim().parse() {
                Ok(idx) => gpus.push(idx),
                Err(_) => return None,
            }
        }
        return Some(gpus);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_free_gpus() {
        assert_eq!(
            parse_gpu_info("[[GPU INFO]] [0,1,3] Free"),
            Some(vec![0, 1, 3])
        );
    }

    #[test]
    fn test_parse_no_free_gpus() {
        assert_eq!(parse_gpu_info("[[GPU INFO]] [] Free"), Some(vec![]));
    }

    #[test]
    fn test_parse_skips_leading_noise() {
        let output = "motd: welcome\n[[GPU INFO]] [2] Free\n";
        assert_eq!(parse_gpu_info(output), Some(vec![2]));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_gpu_info("no marker here"), None);
        assert_eq!(parse_gpu_info("[[GPU INFO]] [a,b] Free"), None);
        assert_eq!(parse_gpu_info("[[GPU INFO]] 0,1 Free"), None);
    }

    #[test]
    fn test_remote_path_is_sanitized_and_unique_per_node() {
        let a = remote_script_path("gpu-1.example.com");
        let b = remote_script_path("gpu-2.example.com");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/gridsweep_probe_gpu_1_example_com_"));
        assert!(!a.contains('-'));
        assert!(!a.contains(' '));
    }
}
