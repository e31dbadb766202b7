//! Explicit slot declarations for object-graph nodes.
//!
//! A [`Descriptor`] lists what the assembler must populate on a fresh
//! instance: the base slot, plain data slots decoded from the JSON body,
//! service slots and data-access slots. Descriptors are validated once at
//! startup and kept in a [`Registry`] keyed by type.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::assembler::{self, Wiring};
use crate::component::{Component, ComponentBase, DataAccess, Role, Service, ServiceHandle};
use crate::db::DbSession;
use crate::error::{ApiError, ApiResult, RegistrationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Data,
    Service,
    DataAccess,
}

impl SlotKind {
    fn label(self) -> &'static str {
        match self {
            SlotKind::Data => "data",
            SlotKind::Service => "service",
            SlotKind::DataAccess => "data-access",
        }
    }
}

type RegisterFn =
    fn(&mut Registry, &mut Vec<(TypeId, &'static str)>) -> Result<(), RegistrationError>;
type DecodeFn<T> = Box<dyn Fn(&mut T, &[u8]) -> serde_json::Result<()> + Send + Sync>;
type ServiceWireFn<T> =
    Box<dyn Fn(&mut T, &Wiring<'_>, Arc<DbSession>) -> ApiResult<()> + Send + Sync>;
type DaoWireFn<T> =
    Box<dyn Fn(&mut T, &Wiring<'_>, &ServiceHandle) -> ApiResult<()> + Send + Sync>;

pub(crate) enum SlotAction<T> {
    Data(DecodeFn<T>),
    Service {
        wire: ServiceWireFn<T>,
        register: RegisterFn,
    },
    DataAccess {
        wire: DaoWireFn<T>,
        register: RegisterFn,
    },
}

pub struct Slot<T> {
    name: &'static str,
    target: &'static str,
    pub(crate) action: SlotAction<T>,
}

impl<T> Slot<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name of the value the slot receives.
    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn kind(&self) -> SlotKind {
        match self.action {
            SlotAction::Data(_) => SlotKind::Data,
            SlotAction::Service { .. } => SlotKind::Service,
            SlotAction::DataAccess { .. } => SlotKind::DataAccess,
        }
    }
}

pub struct Descriptor<T: Component> {
    type_name: &'static str,
    base: Option<fn(&mut T) -> &mut T::Base>,
    slots: Vec<Slot<T>>,
}

impl<T: Component> Descriptor<T> {
    pub fn new() -> Self {
        Self {
            type_name: type_name::<T>(),
            base: None,
            slots: Vec::new(),
        }
    }

    /// Runs `T::describe` on an empty descriptor.
    pub fn of() -> Self {
        let mut descriptor = Self::new();
        T::describe(&mut descriptor);
        descriptor
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn slots(&self) -> &[Slot<T>] {
        &self.slots
    }

    pub(crate) fn base_slot(&self) -> Option<fn(&mut T) -> &mut T::Base> {
        self.base
    }

    /// Declares where the context (and role-specific handles) get injected.
    pub fn base(&mut self, field: fn(&mut T) -> &mut T::Base) -> &mut Self {
        self.base = Some(field);
        self
    }

    /// A field populated by decoding the JSON request body.
    pub fn data<D>(
        &mut self,
        name: &'static str,
        field: fn(&mut T) -> &mut Option<Box<D>>,
    ) -> &mut Self
    where
        D: DeserializeOwned + Send + Sync + 'static,
    {
        self.slots.push(Slot {
            name,
            target: type_name::<D>(),
            action: SlotAction::Data(Box::new(move |node: &mut T, body: &[u8]| {
                let value: D = serde_json::from_slice(body)?;
                *field(node) = Some(Box::new(value));
                Ok(())
            })),
        });
        self
    }

    /// A service allocated, wired and initialised for every request.
    pub fn service<S: Service>(
        &mut self,
        name: &'static str,
        field: fn(&mut T) -> &mut Option<Arc<S>>,
    ) -> &mut Self {
        self.slots.push(Slot {
            name,
            target: type_name::<S>(),
            action: SlotAction::Service {
                wire: Box::new(move |node: &mut T, wiring: &Wiring<'_>, session: Arc<DbSession>| {
                    *field(node) = Some(assembler::wire_service::<S>(wiring, session)?);
                    Ok(())
                }),
                register: Registry::register_inner::<S>,
            },
        });
        self
    }

    /// A data-access node bound to the declaring service.
    pub fn data_access<D: DataAccess>(
        &mut self,
        name: &'static str,
        field: fn(&mut T) -> &mut Option<Arc<D>>,
    ) -> &mut Self {
        self.slots.push(Slot {
            name,
            target: type_name::<D>(),
            action: SlotAction::DataAccess {
                wire: Box::new(move |node: &mut T, wiring: &Wiring<'_>, owner: &ServiceHandle| {
                    *field(node) = Some(assembler::wire_data_access::<D>(wiring, owner)?);
                    Ok(())
                }),
                register: Registry::register_inner::<D>,
            },
        });
        self
    }

    fn validate(&self) -> Result<(), RegistrationError> {
        let role = <T::Base as ComponentBase>::ROLE;
        if self.base.is_none() {
            return Err(RegistrationError::MissingCapability {
                type_name: self.type_name,
                capability: role.capability(),
            });
        }

        let mut seen = HashSet::new();
        for slot in &self.slots {
            if !seen.insert(slot.name) {
                return Err(RegistrationError::DuplicateSlot {
                    type_name: self.type_name,
                    slot: slot.name,
                });
            }
            let allowed = match (role, slot.kind()) {
                (Role::Handler, SlotKind::DataAccess) => false,
                (Role::Service, SlotKind::Data) => false,
                (Role::DataAccess, _) => false,
                _ => true,
            };
            if !allowed {
                return Err(RegistrationError::SlotNotAllowed {
                    type_name: self.type_name,
                    kind: slot.kind().label(),
                    slot: slot.name,
                });
            }
        }
        Ok(())
    }
}

impl<T: Component> Default for Descriptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated descriptors, built at startup and read-only afterwards.
#[derive(Default)]
pub struct Registry {
    descriptors: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `T` and every node reachable from its slots.
    pub fn register<T: Component>(&mut self) -> Result<(), RegistrationError> {
        Self::register_inner::<T>(self, &mut Vec::new())
    }

    fn register_inner<T: Component>(
        &mut self,
        path: &mut Vec<(TypeId, &'static str)>,
    ) -> Result<(), RegistrationError> {
        let id = TypeId::of::<T>();
        if let Some(pos) = path.iter().position(|(seen, _)| *seen == id) {
            let cycle: Vec<&str> = path[pos..]
                .iter()
                .map(|(_, name)| *name)
                .chain(std::iter::once(type_name::<T>()))
                .collect();
            return Err(RegistrationError::CyclicService(cycle.join(" -> ")));
        }
        if self.descriptors.contains_key(&id) {
            return Ok(());
        }

        let descriptor = Descriptor::<T>::of();
        descriptor.validate()?;

        path.push((id, descriptor.type_name));
        for slot in &descriptor.slots {
            match &slot.action {
                SlotAction::Service { register, .. } | SlotAction::DataAccess { register, .. } => {
                    register(self, path)?;
                }
                SlotAction::Data(_) => {}
            }
        }
        path.pop();

        self.descriptors.insert(id, Arc::new(descriptor));
        Ok(())
    }

    pub fn contains<T: Component>(&self) -> bool {
        self.descriptors.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptor<T: Component>(&self) -> ApiResult<Arc<Descriptor<T>>> {
        self.descriptors
            .get(&TypeId::of::<T>())
            .and_then(|any| Arc::clone(any).downcast::<Descriptor<T>>().ok())
            .ok_or_else(|| {
                ApiError::InternalServerError(format!(
                    "component {} is not registered",
                    type_name::<T>()
                ))
            })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}
