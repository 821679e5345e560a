//! Closed enumerations carried by every envelope.
//!
//! Both enums serialize to their dotted / lowercase wire names, which are also
//! the values stored in the indexed stream-record fields.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use agilebus_core::DomainError;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant, )+
        }

        impl $name {
            /// Every member, in declaration order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )+ ];

            /// Wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $wire, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok($name::$variant), )+
                    other => Err(DomainError::unknown_variant($kind, other)),
                }
            }
        }
    };
}

wire_enum! {
    /// Kind of event flowing through the bus.
    pub enum EventType: "event type" {
        AgentRegistered => "agent.registered",
        AgentHeartbeat => "agent.heartbeat",
        AgentTriggered => "agent.triggered",
        AgentCompleted => "agent.completed",
        AgentError => "agent.error",

        GitIssueCreated => "git.issue.created",
        GitIssueUpdated => "git.issue.updated",
        GitPrCreated => "git.pr.created",
        GitPrUpdated => "git.pr.updated",
        GitPush => "git.push",
        GitRelease => "git.release",

        WorkflowStarted => "workflow.started",
        WorkflowCompleted => "workflow.completed",
        WorkflowFailed => "workflow.failed",

        WellnessCheckin => "wellness.checkin",
        WellnessAlert => "wellness.alert",

        SystemHealth => "system.health",
        SystemMaintenance => "system.maintenance",
    }
}

wire_enum! {
    /// Advisory priority. The bus never reorders delivery by priority.
    pub enum EventPriority: "event priority" {
        Low => "low",
        Normal => "normal",
        High => "high",
        Critical => "critical",
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}
