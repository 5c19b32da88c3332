//! Custom resource model: the `Sandbox`, `SandboxPool` and `SandboxTemplate` kinds,
//! their labels and annotations, and construction of the backing pod.

mod podspec;
mod pool;
mod sandbox;
mod template;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// API group of the monobox custom resources.
pub const API_GROUP: &str = "monobox.zerocore.ai";

/// API version of the monobox custom resources.
pub const API_VERSION: &str = "v1alpha1";

/// Label carrying the owning pool's name on pool-member sandboxes.
pub const POOL_LABEL: &str = "monobox.zerocore.ai/pool";

/// Label marking whether a pool member has been handed to a caller.
pub const CLAIMED_LABEL: &str = "monobox.zerocore.ai/claimed";

/// Label marking backing pods as managed by this controller.
pub const SANDBOX_LABEL: &str = "monobox.zerocore.ai/sandbox";

/// Label carrying the owning sandbox's name on backing pods.
pub const SANDBOX_NAME_LABEL: &str = "monobox.zerocore.ai/sandbox-name";

/// Annotation recording a backing pod's expiry time.
pub const EXPIRES_AT_ANNOTATION: &str = "monobox.zerocore.ai/expires-at";

/// Name of the single container inside every backing pod.
pub const SANDBOX_CONTAINER: &str = "sandbox";

/// Scratch directory mounted into every sandbox; default working directory for exec.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Name of the scratch volume backing [`WORKSPACE_DIR`].
pub const WORKSPACE_VOLUME: &str = "workspace";

/// Mount point of the optional persistent volume claim.
pub const SHARED_DIR: &str = "/shared";

/// Name of the optional persistent volume claim volume.
pub const SHARED_VOLUME: &str = "shared-data";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the full `group/version` string of the monobox API.
pub fn api_version() -> String {
    format!("{API_GROUP}/{API_VERSION}")
}

/// Returns the label selector matching the members of `pool`.
pub fn pool_selector(pool: &str) -> String {
    format!("{POOL_LABEL}={pool}")
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use podspec::*;
pub use pool::*;
pub use sandbox::*;
pub use template::*;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use kube::Resource;

    use super::*;

    #[test]
    fn test_constants_match_derived_kinds() {
        assert_eq!(Sandbox::group(&()), API_GROUP);
        assert_eq!(Sandbox::version(&()), API_VERSION);
        assert_eq!(Sandbox::kind(&()), "Sandbox");
        assert_eq!(Sandbox::plural(&()), "sandboxes");

        assert_eq!(SandboxPool::group(&()), API_GROUP);
        assert_eq!(SandboxPool::kind(&()), "SandboxPool");
        assert_eq!(SandboxPool::plural(&()), "sandboxpools");

        assert_eq!(SandboxTemplate::group(&()), API_GROUP);
        assert_eq!(SandboxTemplate::kind(&()), "SandboxTemplate");
        assert_eq!(SandboxTemplate::plural(&()), "sandboxtemplates");
    }

    #[test]
    fn test_pool_selector_shape() {
        assert_eq!(pool_selector("py-pool"), "monobox.zerocore.ai/pool=py-pool");
    }
}
