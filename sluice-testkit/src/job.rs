use sluice::{Dependency, JobSpec};

/// A minimal spec with no retries, so failure paths stay short in tests.
pub fn quick_spec(cmd: &str) -> JobSpec {
    JobSpec::new(cmd, "/tmp").with_retries(0)
}

/// A spec with an explicit retry budget.
pub fn failing_spec(cmd: &str, retries: u32) -> JobSpec {
    JobSpec::new(cmd, "/tmp").with_retries(retries)
}

/// A spec labelled for reporting and wired into a dependency group chain.
pub fn spec_in_group(
    cmd: &str,
    rep_group: &str,
    dep_groups: Vec<String>,
    dependencies: Vec<Dependency>,
) -> JobSpec {
    JobSpec::new(cmd, "/tmp")
        .with_rep_group(rep_group)
        .with_dep_groups(dep_groups)
        .with_dependencies(dependencies)
}
