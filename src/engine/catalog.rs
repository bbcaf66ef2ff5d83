use std::sync::Arc;

use tokio::sync::RwLock;

use crate::audit::TimelineEvent;
use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_amount, validate_id, validate_len};
use super::{Engine, EngineError};

/// Partial update of a resource. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub location: Option<String>,
    pub hourly_rate: Option<Money>,
    pub capacity: Option<u32>,
    pub min_booking_hours: Option<u32>,
    pub active: Option<bool>,
}

impl ResourcePatch {
    pub fn is_empty(&self) -> bool {
        *self == ResourcePatch::default()
    }

    fn apply(self, resource: &mut Resource) {
        if let Some(name) = self.name {
            resource.name = name;
        }
        if let Some(location) = self.location {
            resource.location = location;
        }
        if let Some(rate) = self.hourly_rate {
            resource.hourly_rate = rate;
        }
        if let Some(capacity) = self.capacity {
            resource.capacity = capacity;
        }
        if let Some(min) = self.min_booking_hours {
            resource.min_booking_hours = min;
        }
        if let Some(active) = self.active {
            resource.active = active;
        }
    }
}

fn validate_resource(resource: &Resource) -> Result<(), EngineError> {
    validate_id(&resource.id, "resource id")?;
    validate_len(&resource.name, MAX_NAME_LEN, "resource name too long")?;
    validate_len(&resource.location, MAX_NAME_LEN, "location too long")?;
    validate_amount(resource.hourly_rate)?;
    if resource.hourly_rate < Money::ZERO {
        return Err(EngineError::Invalid("hourly rate must not be negative".into()));
    }
    Ok(())
}

impl Engine {
    pub async fn create_resource(&self, actor: &Actor, resource: Resource) -> Result<(), EngineError> {
        if !actor.is_privileged() {
            return Err(EngineError::Forbidden("only staff may create resources"));
        }
        validate_resource(&resource)?;
        let _commit = self.commit_gate.read().await;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(format!("resource {}", resource.id)));
        }

        let event = Event::ResourceCreated {
            resource: resource.clone(),
        };
        self.wal_append(&event).await?;
        let id = resource.id.clone();
        self.resources
            .insert(id.clone(), Arc::new(RwLock::new(ResourceState::new(resource))));
        self.notify.send_event(&id, &event);
        self.audit.log_event(TimelineEvent::new(
            actor,
            id.clone(),
            "resource",
            "resource_created",
            format!("resource {id} created"),
        ));
        Ok(())
    }

    pub async fn update_resource(
        &self,
        actor: &Actor,
        id: &str,
        patch: ResourcePatch,
    ) -> Result<Resource, EngineError> {
        if !actor.is_privileged() {
            return Err(EngineError::Forbidden("only staff may update resources"));
        }
        let _commit = self.commit_gate.read().await;
        let rs = self
            .get_resource(id)
            .ok_or_else(|| EngineError::NotFound(format!("resource {id}")))?;
        let mut guard = rs.write().await;

        let mut updated = guard.resource.clone();
        patch.apply(&mut updated);
        validate_resource(&updated)?;
        if updated == guard.resource {
            return Ok(updated);
        }

        let event = Event::ResourceUpdated {
            resource: updated.clone(),
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        self.audit.log_event(
            TimelineEvent::new(actor, id, "resource", "resource_updated", format!("resource {id} updated"))
                .with("active", updated.active)
                .with("hourly_rate", updated.hourly_rate.to_string()),
        );
        Ok(updated)
    }
}
