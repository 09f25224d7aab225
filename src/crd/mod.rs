pub mod canary_release;
pub mod condition;
pub mod release;

pub use canary_release::{
    canary_owner_reference, created_by_value, split_namespace_name, CanaryPort, CanaryPortConfig,
    CanaryProtocol, CanaryRelease, CanaryReleaseProxyStatus, CanaryReleaseSpec,
    CanaryReleaseStatus, CanaryService, CanaryTransition, PodStatus, GROUP, LABEL_CREATED_BY,
    VERSION,
};
pub use condition::{
    new_condition, new_error_condition, CanaryReleaseCondition, CanaryReleaseConditionType,
    REASON_ADOPTED, REASON_AVAILABLE, REASON_CREATING, REASON_DEPRECATED, REASON_ERROR,
    REASON_UPDATING,
};
pub use release::{
    release_controller_of, release_owner_reference, Application, ApplicationGraph,
    ApplicationSpec, GraphVertex, GraphVertexSpec, Release, ReleaseSpec, ReleaseStatus,
};
