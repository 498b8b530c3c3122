//! Shell-pool configuration: `RSYSD_SHELLS` parsing and endpoint defaults
//! (`# 4.4`, "Configuration"/"Startup" steps 1 and 4).

use pdip::CpuSet;

/// Default dispatcher socket path, matching `RSYS_SOCKET_PATH` in
/// `original_source/rsys/rsys_p.h`.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/rsys.socket";

pub fn socket_path() -> String {
    std::env::var("RSYS_SOCKET_PATH").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string())
}

/// Parses `RSYSD_SHELLS` into one [`CpuSet`] per shell to spawn.
///
/// Grammar, ported from `original_source/rsys/rsystemd.c`'s
/// `rsysd_get_affinity`: a colon-separated list of fields, one field per
/// shell, each field a comma-separated list of either a single CPU number
/// or a dashed range (`a-b`). An empty field means "all CPUs." An unset or
/// empty environment variable parses as a single shell with affinity to
/// all CPUs.
pub fn parse_shell_affinities(spec: &str) -> Result<Vec<CpuSet>, String> {
    if spec.is_empty() {
        let mut all = CpuSet::alloc();
        all.all();
        return Ok(vec![all]);
    }
    spec.split(':').map(parse_one_field).collect()
}

fn parse_one_field(field: &str) -> Result<CpuSet, String> {
    let mut cpus = CpuSet::alloc();
    if field.is_empty() {
        cpus.all();
        return Ok(cpus);
    }
    for term in field.split(',') {
        if term.is_empty() {
            continue;
        }
        if let Some((start, end)) = term.split_once('-') {
            let start: usize = start
                .parse()
                .map_err(|_| format!("invalid range start in {term:?}"))?;
            let end: usize = end
                .parse()
                .map_err(|_| format!("invalid range end in {term:?}"))?;
            let (start, end) = if start <= end { (start, end) } else { (end, start) };
            for cpu in start..=end.min(CpuSet::cpu_count().saturating_sub(1)) {
                cpus.set(cpu).map_err(|e| e.to_string())?;
            }
        } else {
            let cpu: usize = term.parse().map_err(|_| format!("invalid CPU number {term:?}"))?;
            if cpu < CpuSet::cpu_count() {
                cpus.set(cpu).map_err(|e| e.to_string())?;
            }
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_is_one_shell_all_cpus() {
        let shells = parse_shell_affinities("").unwrap();
        assert_eq!(shells.len(), 1);
        assert!(!shells[0].is_empty());
    }

    #[test]
    fn four_fields_produce_four_shells() {
        let shells = parse_shell_affinities("0:1-3::3,4,6").unwrap();
        assert_eq!(shells.len(), 4);
        assert!(shells[0].is_set(0).unwrap());
        // field 2 ("") is "all CPUs"
        assert!(!shells[2].is_empty());
    }

    #[test]
    fn range_sets_every_cpu_in_bounds() {
        let shells = parse_shell_affinities("0-1").unwrap();
        assert!(shells[0].is_set(0).unwrap());
        if CpuSet::cpu_count() > 1 {
            assert!(shells[0].is_set(1).unwrap());
        }
    }

    #[test]
    fn reversed_range_is_normalized() {
        let shells = parse_shell_affinities("1-0").unwrap();
        assert!(shells[0].is_set(0).unwrap());
    }

    #[test]
    fn garbage_term_is_an_error() {
        assert!(parse_one_field("not-a-number").is_err());
    }
}
