//! `get-entity`, `create-entity`, `update-entity` and `delete-entity`, plus
//! `increase-attribute` / `decrease-attribute` for numeric fields.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Envelope;
use serde_json::{json, Map, Number, Value};
use tracing::{debug, info};

use crate::dispatch::{DispatchTable, HandlerError, RequestHandler, SendContext};
use crate::documents::DocumentStore;

fn required_str<'a>(request: &'a Envelope, field: &str) -> Result<&'a str, HandlerError> {
    request
        .field_str(field)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandlerError::missing_field(field))
}

fn to_value(document: &impl serde::Serialize) -> Result<Value, HandlerError> {
    serde_json::to_value(document).map_err(|e| HandlerError::Backend(e.to_string()))
}

pub struct GetEntity {
    store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl RequestHandler for GetEntity {
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError> {
        let uuid = required_str(&request, "uuid")?;
        debug!(uuid, "fetching entity");
        let document = self.store.get(uuid).await?;
        let _ = ctx.reply(
            Envelope::new("entity-data")
                .with_field("uuid", document.uuid.clone())
                .with_field("data", to_value(&document)?),
        );
        Ok(())
    }

    fn response_kind(&self) -> Option<&str> {
        Some("entity-data")
    }
}

pub struct CreateEntity {
    store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl RequestHandler for CreateEntity {
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError> {
        let entity_type = required_str(&request, "entityType")?;
        let data = request.field("data").cloned().unwrap_or(Value::Null);
        let folder = request.field_str("folder").map(str::to_owned);

        let document = self.store.create(entity_type, data, folder).await?;
        info!(uuid = %document.uuid, entity_type, "entity created");
        let _ = ctx.reply(
            Envelope::new("entity-created")
                .with_field("uuid", document.uuid.clone())
                .with_field("entity", to_value(&document)?),
        );
        Ok(())
    }

    fn response_kind(&self) -> Option<&str> {
        Some("entity-created")
    }
}

pub struct UpdateEntity {
    store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl RequestHandler for UpdateEntity {
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError> {
        let uuid = required_str(&request, "uuid")?;
        let changes = request
            .field("updateData")
            .cloned()
            .ok_or_else(|| HandlerError::missing_field("updateData"))?;

        let document = self.store.update(uuid, changes).await?;
        info!(uuid, "entity updated");
        let _ = ctx.reply(
            Envelope::new("entity-updated")
                .with_field("uuid", uuid)
                .with_field("entity", to_value(&document)?),
        );
        Ok(())
    }

    fn response_kind(&self) -> Option<&str> {
        Some("entity-updated")
    }
}

pub struct DeleteEntity {
    store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl RequestHandler for DeleteEntity {
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError> {
        let uuid = required_str(&request, "uuid")?;
        self.store.delete(uuid).await?;
        info!(uuid, "entity deleted");
        let _ = ctx.reply(
            Envelope::new("entity-deleted")
                .with_field("uuid", uuid)
                .with_field("success", true),
        );
        Ok(())
    }

    fn response_kind(&self) -> Option<&str> {
        Some("entity-deleted")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
}

/// Add to or subtract from a numeric field addressed by a dotted path into
/// the document's data, e.g. `attributes.hp.value`.
pub struct ModifyAttribute {
    store: Arc<dyn DocumentStore>,
    direction: Direction,
}

#[async_trait]
impl RequestHandler for ModifyAttribute {
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError> {
        let uuid = required_str(&request, "uuid")?;
        let attribute = request
            .field_str("attribute")
            .filter(|path| !path.is_empty() && path.split('.').all(|s| !s.is_empty()))
            .ok_or_else(|| HandlerError::InvalidRequest("Attribute path is required".into()))?;
        let amount = match request.field("amount") {
            Some(Value::Number(n)) => n.clone(),
            _ => return Err(HandlerError::InvalidRequest("Amount must be a number".into())),
        };

        let document = self.store.get(uuid).await?;
        let old = match attribute
            .split('.')
            .try_fold(&document.data, |value, key| value.get(key))
        {
            Some(Value::Number(n)) => n.clone(),
            other => {
                return Err(HandlerError::InvalidRequest(format!(
                    "Attribute {attribute} is not a number, found: {}",
                    type_name(other)
                )))
            }
        };
        let new = apply(self.direction, &old, &amount)?;

        let changes = attribute
            .rsplit('.')
            .fold(Value::Number(new.clone()), |inner, key| {
                let mut object = Map::new();
                let _ = object.insert(key.to_owned(), inner);
                Value::Object(object)
            });
        let _ = self.store.update(uuid, changes).await?;
        info!(uuid, attribute, %old, %new, "attribute modified");
        let _ = ctx.reply(
            Envelope::new("modify-attribute-result")
                .with_field(
                    "results",
                    json!([{
                        "uuid": uuid,
                        "attribute": attribute,
                        "oldValue": old,
                        "newValue": new,
                    }]),
                )
                .with_field("success", true),
        );
        Ok(())
    }

    fn response_kind(&self) -> Option<&str> {
        Some("modify-attribute-result")
    }
}

/// Integer arithmetic while both sides are integers and the result fits,
/// floating point otherwise.
fn apply(direction: Direction, current: &Number, amount: &Number) -> Result<Number, HandlerError> {
    if let (Some(a), Some(b)) = (current.as_i64(), amount.as_i64()) {
        let exact = match direction {
            Direction::Increase => a.checked_add(b),
            Direction::Decrease => a.checked_sub(b),
        };
        if let Some(n) = exact {
            return Ok(n.into());
        }
    }
    let (a, b) = match (current.as_f64(), amount.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(HandlerError::InvalidRequest("Amount must be a number".into())),
    };
    let result = match direction {
        Direction::Increase => a + b,
        Direction::Decrease => a - b,
    };
    Number::from_f64(result)
        .ok_or_else(|| HandlerError::InvalidRequest(format!("Result is not finite: {result}")))
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// Register the entity handlers against `store`.
pub fn register_entity_handlers(table: &DispatchTable, store: Arc<dyn DocumentStore>) {
    table.register("get-entity", GetEntity { store: store.clone() });
    table.register("create-entity", CreateEntity { store: store.clone() });
    table.register("update-entity", UpdateEntity { store: store.clone() });
    table.register("delete-entity", DeleteEntity { store: store.clone() });
    table.register(
        "increase-attribute",
        ModifyAttribute {
            store: store.clone(),
            direction: Direction::Increase,
        },
    );
    table.register(
        "decrease-attribute",
        ModifyAttribute {
            store,
            direction: Direction::Decrease,
        },
    );
}
