//! The construction plan: which component is built when, from what.
//!
//! Each [`PlanStep`] names the handles it needs and the handles it yields.
//! [`ConstructionPlan::new`] rejects a plan where a step needs something no
//! earlier step provides, where a handle has two providers, or where a step
//! appears twice.  [`PlanTracker`] then enforces the plan while components are
//! actually built.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;

use thiserror::Error;
use tracing::info;

use crate::error::AppError;

/// The eleven components of a node, in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentId {
    SharedStores,
    Federation,
    RoomServer,
    TypingServer,
    AppService,
    FederationSender,
    ClientApi,
    FederationApi,
    MediaApi,
    PublicRoomsApi,
    SyncApi,
}

impl ComponentId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SharedStores => "shared-stores",
            Self::Federation => "federation",
            Self::RoomServer => "roomserver",
            Self::TypingServer => "typingserver",
            Self::AppService => "appservice",
            Self::FederationSender => "federationsender",
            Self::ClientApi => "clientapi",
            Self::FederationApi => "federationapi",
            Self::MediaApi => "mediaapi",
            Self::PublicRoomsApi => "publicroomsapi",
            Self::SyncApi => "syncapi",
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something one component hands to later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    AccountsDb,
    DeviceDb,
    ServerKeyDb,
    FederationClient,
    KeyRing,
    RoomAlias,
    RoomInput,
    RoomQuery,
    TypingInput,
    AppServiceQuery,
    FederationSender,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanStep {
    pub id: ComponentId,
    pub requires: &'static [Handle],
    pub provides: &'static [Handle],
}

use ComponentId as C;
use Handle as H;

/// The node's component graph.
pub const STEPS: [PlanStep; 11] = [
    PlanStep {
        id: C::SharedStores,
        requires: &[],
        provides: &[H::AccountsDb, H::DeviceDb, H::ServerKeyDb],
    },
    PlanStep {
        id: C::Federation,
        requires: &[H::ServerKeyDb],
        provides: &[H::FederationClient, H::KeyRing],
    },
    PlanStep {
        id: C::RoomServer,
        requires: &[],
        provides: &[H::RoomAlias, H::RoomInput, H::RoomQuery],
    },
    PlanStep {
        id: C::TypingServer,
        requires: &[],
        provides: &[H::TypingInput],
    },
    PlanStep {
        id: C::AppService,
        requires: &[H::AccountsDb, H::DeviceDb, H::FederationClient, H::RoomAlias, H::RoomQuery],
        provides: &[H::AppServiceQuery],
    },
    PlanStep {
        id: C::FederationSender,
        requires: &[H::FederationClient, H::RoomQuery],
        provides: &[H::FederationSender],
    },
    PlanStep {
        id: C::ClientApi,
        requires: &[
            H::DeviceDb,
            H::AccountsDb,
            H::FederationClient,
            H::KeyRing,
            H::RoomAlias,
            H::RoomInput,
            H::RoomQuery,
            H::TypingInput,
            H::AppServiceQuery,
            H::FederationSender,
        ],
        provides: &[],
    },
    PlanStep {
        id: C::FederationApi,
        requires: &[
            H::AccountsDb,
            H::DeviceDb,
            H::FederationClient,
            H::KeyRing,
            H::RoomAlias,
            H::RoomInput,
            H::RoomQuery,
            H::AppServiceQuery,
            H::FederationSender,
        ],
        provides: &[],
    },
    PlanStep {
        id: C::MediaApi,
        requires: &[H::DeviceDb],
        provides: &[],
    },
    PlanStep {
        id: C::PublicRoomsApi,
        requires: &[H::DeviceDb, H::RoomQuery],
        provides: &[],
    },
    PlanStep {
        id: C::SyncApi,
        requires: &[H::DeviceDb, H::AccountsDb, H::RoomQuery, H::FederationClient],
        provides: &[],
    },
];

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("{step} requires {handle:?}, which no earlier step provides")]
    MissingRequirement { step: ComponentId, handle: Handle },
    #[error("{handle:?} is provided by both {first} and {second}")]
    DuplicateProvider {
        handle: Handle,
        first: ComponentId,
        second: ComponentId,
    },
    #[error("{0} appears more than once")]
    DuplicateStep(ComponentId),
    #[error("{got} is out of order; next planned step is {expected}")]
    OutOfOrder { expected: ComponentId, got: ComponentId },
    #[error("{0} is not in the plan or the plan is complete")]
    Exhausted(ComponentId),
}

/// A validated, ordered list of steps.
#[derive(Debug, Clone)]
pub struct ConstructionPlan {
    steps: Vec<PlanStep>,
}

impl ConstructionPlan {
    pub fn new(steps: &[PlanStep]) -> Result<Self, PlanError> {
        let mut seen = HashSet::new();
        let mut providers: HashMap<Handle, ComponentId> = HashMap::new();
        for step in steps {
            if !seen.insert(step.id) {
                return Err(PlanError::DuplicateStep(step.id));
            }
            if let Some(&handle) = step.requires.iter().find(|h| !providers.contains_key(*h)) {
                return Err(PlanError::MissingRequirement { step: step.id, handle });
            }
            for &handle in step.provides {
                if let Some(&first) = providers.get(&handle) {
                    return Err(PlanError::DuplicateProvider {
                        handle,
                        first,
                        second: step.id,
                    });
                }
                providers.insert(handle, step.id);
            }
        }
        Ok(Self { steps: steps.to_vec() })
    }

    /// The node's own plan.
    pub fn standard() -> Result<Self, PlanError> {
        Self::new(&STEPS)
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn order(&self) -> Vec<ComponentId> {
        self.steps.iter().map(|s| s.id).collect()
    }
}

/// Walks a [`ConstructionPlan`] while the components are built.
pub struct PlanTracker {
    plan: ConstructionPlan,
    provided: HashSet<Handle>,
    assembled: Vec<ComponentId>,
}

impl PlanTracker {
    pub fn new(plan: ConstructionPlan) -> Self {
        Self {
            plan,
            provided: HashSet::new(),
            assembled: Vec::new(),
        }
    }

    fn check(&self, id: ComponentId) -> Result<&PlanStep, PlanError> {
        let step = self
            .plan
            .steps
            .get(self.assembled.len())
            .ok_or(PlanError::Exhausted(id))?;
        if step.id != id {
            return Err(PlanError::OutOfOrder { expected: step.id, got: id });
        }
        if let Some(&handle) = step.requires.iter().find(|h| !self.provided.contains(*h)) {
            return Err(PlanError::MissingRequirement { step: id, handle });
        }
        Ok(step)
    }

    /// Run the setup future for `id` if it is the next step in the plan.
    pub async fn step<T>(
        &mut self,
        id: ComponentId,
        setup: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        let provides = self
            .check(id)
            .map_err(|e| AppError::Assembly(e.to_string()))?
            .provides;
        let value = setup
            .await
            .map_err(|e| AppError::Assembly(format!("{id}: {e}")))?;

        self.provided.extend(provides.iter().copied());
        self.assembled.push(id);
        metrics::counter!("p2pnode_components_assembled_total", "component" => id.as_str()).increment(1);
        info!(
            component = %id,
            step = self.assembled.len(),
            of = self.plan.steps.len(),
            "component assembled"
        );
        Ok(value)
    }

    pub fn assembled(&self) -> &[ComponentId] {
        &self.assembled
    }

    pub fn is_complete(&self) -> bool {
        self.assembled.len() == self.plan.steps.len()
    }

    pub fn into_assembled(self) -> Vec<ComponentId> {
        self.assembled
    }
}
