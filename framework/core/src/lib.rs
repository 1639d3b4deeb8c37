mod sched;
mod shutdown;

pub mod prelude {
    pub use crate::sched::{
        current_scheduling_group, FairShareExecutor, SchedulingGroup, SchedulingGroupError, SchedulingGroups, Task,
        DEFAULT_SHARES, MAX_SCHEDULING_GROUPS,
    };
    pub use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle, ShutdownSignalError};
}
