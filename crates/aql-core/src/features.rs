//! Dispatch feature masks shared by agents and queues

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Packet kinds an agent can consume, or a queue is allowed to carry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Features: u32 {
        const KERNEL_DISPATCH = 1 << 0;
        const AGENT_DISPATCH = 1 << 1;
    }
}

impl Features {
    /// True if at least one dispatch kind is present.
    pub const fn can_dispatch(self) -> bool {
        self.intersects(Self::KERNEL_DISPATCH.union(Self::AGENT_DISPATCH))
    }
}
