//! Mapping between container ids and engine-visible container names.
//!
//! Names are produced as `<prefix><id>` with a single process-global prefix
//! so that recovery can cheaply tell the manager's containers apart from
//! co-tenants without any per-container registry lookup.

use crate::constants::DOCKER_NAME_PREFIX;
use crate::spec::ContainerId;

/// Builds the engine-visible name for a container.
pub fn container_name(container_id: &ContainerId) -> String {
    format!("{}{}", DOCKER_NAME_PREFIX, container_id)
}

/// Parses a container id back out of an engine-reported name.
///
/// Engines may report names with a leading slash, so both `<prefix>…` and
/// `/<prefix>…` are accepted. Returns `None` for names the manager did not
/// produce; recovery uses this to leave foreign containers alone.
pub fn parse(name: &str) -> Option<ContainerId> {
    let name = name.strip_prefix('/').unwrap_or(name);
    name.strip_prefix(DOCKER_NAME_PREFIX)
        .map(ContainerId::from)
}
