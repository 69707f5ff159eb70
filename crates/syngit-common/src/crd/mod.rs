//! Custom Resource Definitions for syngit
//!
//! All four kinds live in the `syngit.io/v1beta3` API group and are namespaced.

mod remote_syncer;
mod remote_target;
mod remote_user;
mod remote_user_binding;
mod types;

pub use remote_syncer::{
    LastBypassedObjectState, LastObservedObjectState, LastPushedObjectState, ObservedObject,
    ObservedUser, PushedTarget, RemoteSyncer, RemoteSyncerSpec, RemoteSyncerStatus,
    ScopedResources, Strategy, TargetStrategy, UnauthorizedUserMode, UserSpecificMode,
};
pub use remote_target::{MergeStrategy, RemoteTarget, RemoteTargetSpec};
pub use remote_user::{annotation_is_true, RemoteUser, RemoteUserSpec};
pub use remote_user_binding::{RemoteUserBinding, RemoteUserBindingSpec};
pub use types::{
    set_condition, Condition, ConditionStatus, NamespacedObjectRef, ObjectRef, Subject,
};
