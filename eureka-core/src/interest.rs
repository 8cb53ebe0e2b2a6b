//! Interest: selection predicate over InstanceInfo. Composite interests are one subscription
//! whose matching set is the union of their parts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::instance::InstanceInfo;
use crate::DiscoveryError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interest {
    All,
    Application { names: BTreeSet<String> },
    Vip { vip: String },
    Composite { interests: Vec<Interest> },
}

impl Interest {
    pub fn matches(&self, info: &InstanceInfo) -> bool {
        match self {
            Interest::All => true,
            Interest::Application { names } => names.contains(info.app()),
            Interest::Vip { vip } => info.vip_address() == Some(vip.as_str()),
            Interest::Composite { interests } => interests.iter().any(|i| i.matches(info)),
        }
    }

    /// Rejects interests that can never match anything (empty name sets, empty composites).
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        match self {
            Interest::All => Ok(()),
            Interest::Application { names } if names.is_empty() => Err(DiscoveryError::InvalidArgument(
                "application interest needs at least one name".into(),
            )),
            Interest::Application { names } => {
                if names.iter().any(|n| n.trim().is_empty()) {
                    return Err(DiscoveryError::InvalidArgument("blank application name in interest".into()));
                }
                Ok(())
            }
            Interest::Vip { vip } if vip.trim().is_empty() => {
                Err(DiscoveryError::InvalidArgument("vip interest needs a vip address".into()))
            }
            Interest::Vip { .. } => Ok(()),
            Interest::Composite { interests } if interests.is_empty() => {
                Err(DiscoveryError::InvalidArgument("composite interest is empty".into()))
            }
            Interest::Composite { interests } => interests.iter().try_for_each(Interest::validate),
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::All => f.write_str("all"),
            Interest::Application { names } => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "apps[{}]", names.join(","))
            }
            Interest::Vip { vip } => write!(f, "vip[{}]", vip),
            Interest::Composite { interests } => {
                let parts: Vec<String> = interests.iter().map(ToString::to_string).collect();
                write!(f, "any({})", parts.join(" | "))
            }
        }
    }
}

/// Interest constructors.
pub struct Interests;

impl Interests {
    pub fn for_full_registry() -> Interest {
        Interest::All
    }

    pub fn for_applications<I, S>(names: I) -> Interest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interest::Application {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// One interest per vip; several vips become a composite.
    pub fn for_vips<I, S>(vips: I) -> Interest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts: Vec<Interest> = vips.into_iter().map(|v| Interest::Vip { vip: v.into() }).collect();
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Interest::Composite { interests: parts }
        }
    }

    pub fn for_some(interests: Vec<Interest>) -> Interest {
        Interest::Composite { interests }
    }
}
