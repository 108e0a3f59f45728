//! Tests for the resource-statistics probe.

use stevedore::usage::parse_stat_line;

const STAT: &str = "4321 (nginx: master) S 1 4321 4321 0 -1 4194560 \
                    900 40 0 0 120 60 15 5 20 0 2 0 555 10485760 2048 \
                    18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

#[test]
fn test_counters_are_read_past_the_command_name() {
    // "(nginx: master)" contains a space; fields must count from the last
    // closing parenthesis.
    let sample = parse_stat_line(STAT).unwrap();
    assert_eq!(sample.utime, 120);
    assert_eq!(sample.stime, 60);
    assert_eq!(sample.cutime, 15);
    assert_eq!(sample.cstime, 5);
    assert_eq!(sample.num_threads, 2);
    assert_eq!(sample.rss_pages, 2048);
}

#[test]
fn test_truncated_lines_are_rejected() {
    assert!(parse_stat_line("").is_none());
    assert!(parse_stat_line("4321 (sh) S 1 2 3").is_none());
}

#[cfg(target_os = "linux")]
mod linux {
    use stevedore::usage::usage;

    #[test]
    fn test_sampling_the_current_process() {
        let statistics = usage(std::process::id() as i32, true, true).unwrap();

        assert!(statistics.timestamp > 0.0);
        assert!(statistics.mem_rss_bytes > 0);
        assert!(statistics.threads.unwrap() >= 1);
        // Limits are annotations the manager adds later, never the probe's.
        assert_eq!(statistics.cpus_limit, None);
        assert_eq!(statistics.mem_limit_bytes, None);
    }

    #[test]
    fn test_children_toggle_changes_only_cpu_attribution() {
        let pid = std::process::id() as i32;
        let with_children = usage(pid, true, false).unwrap();
        let without = usage(pid, false, false).unwrap();

        assert!(with_children.cpus_user_time_secs >= without.cpus_user_time_secs);
        assert!(with_children.cpus_system_time_secs >= without.cpus_system_time_secs);
        assert_eq!(without.threads, None);
    }

    #[test]
    fn test_dead_pid_fails() {
        // Pid 0 is never a valid /proc entry to sample.
        assert!(usage(0, true, true).is_err());
    }
}
