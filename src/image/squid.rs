//! Squid proxy image: pulled from the registry for releases, built
//! locally otherwise.

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::{DOCKERFILE_SQUID, VERSION, is_release_version};
use crate::runtime::Runtime;

pub const SQUID_IMAGE: &str = "exitbox-squid";
pub const SQUID_IMAGE_REGISTRY: &str = "ghcr.io/cloud-exit/exitbox-squid";

/// Ensure the squid proxy image exists at the current version.
///
/// An existing image with a matching `exitbox.version` label is reused.
/// For release versions, the pre-built registry image is pulled and
/// re-tagged; pull failure falls back to a local build.
pub fn build_squid(rt: &dyn Runtime, force: bool) -> Result<()> {
    if !force && rt.image_exists(SQUID_IMAGE) {
        let v = rt
            .image_inspect(SQUID_IMAGE, r#"{{index .Config.Labels "exitbox.version"}}"#)
            .unwrap_or_default();
        if v == VERSION {
            return Ok(());
        }
        info!(have = %v, want = VERSION, "squid image version mismatch, rebuilding");
    }

    if is_release_version(VERSION) {
        let remote = format!("{}:{}", SQUID_IMAGE_REGISTRY, VERSION);
        match rt.pull(&remote) {
            Ok(()) => {
                if rt.tag(&remote, SQUID_IMAGE).is_ok() {
                    info!("squid image ready (from registry)");
                    return Ok(());
                }
                warn!("failed to tag pulled squid image, building locally");
            }
            Err(e) => {
                warn!(error = %e, remote = %remote, "could not pull squid image, building locally");
            }
        }
    }

    build_squid_local(rt)
}

fn build_squid_local(rt: &dyn Runtime) -> Result<()> {
    info!("building squid proxy image locally");
    let args = vec![
        "--build-arg".to_string(),
        format!("EXITBOX_VERSION={}", VERSION),
    ];
    super::build_from_dockerfile(rt, "build-squid", DOCKERFILE_SQUID, SQUID_IMAGE, &args)
        .context("Failed to build squid image")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::MockRuntime;

    #[test]
    fn existing_matching_version_is_reused() {
        let _env = crate::test_support::EnvGuard::isolated();
        let rt = MockRuntime::new().with_image(SQUID_IMAGE, VERSION);
        build_squid(&rt, false).unwrap();
        assert!(rt.built().is_empty());
        assert!(rt.pulls.lock().unwrap().is_empty());
    }

    #[test]
    fn version_mismatch_triggers_rebuild() {
        let _env = crate::test_support::EnvGuard::isolated();
        let rt = MockRuntime::new().with_image(SQUID_IMAGE, "0.0.1");
        build_squid(&rt, false).unwrap();
        // Dev versions build locally; release versions would pull first.
        if is_release_version(VERSION) {
            assert!(!rt.pulls.lock().unwrap().is_empty() || !rt.built().is_empty());
        } else {
            assert_eq!(rt.built(), vec![SQUID_IMAGE.to_string()]);
        }
    }

    #[test]
    fn pull_failure_falls_back_to_local_build() {
        let _env = crate::test_support::EnvGuard::isolated();
        let mut rt = MockRuntime::new();
        rt.fail_pull = true;
        build_squid(&rt, true).unwrap();
        assert_eq!(rt.built(), vec![SQUID_IMAGE.to_string()]);
    }
}
