//! Service endpoint handlers

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::Router;
use crate::error::{HubError, HubResult};
use crate::message::{types, Message};
use crate::registry::{ParticipantStatus, ToolDescriptor};

impl Router {
    pub(super) async fn handle_service_message(
        &self,
        connection_id: Uuid,
        kind: &str,
        msg: &Message,
    ) -> HubResult<()> {
        if kind == types::SERVICE_REGISTER {
            return self.service_register(connection_id, msg).await;
        }
        let service = self
            .state
            .services
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| {
                HubError::NotFound("connection is not bound to a registered service".to_string())
            })?;

        match kind {
            types::SERVICE_TASK_RESULT => self.handle_service_task_result(msg).await,
            types::SERVICE_TASK_ERROR => self.handle_service_task_error(msg).await,
            types::SERVICE_TASK_NOTIFICATION => self.handle_service_task_notification(msg).await,
            types::SERVICE_STATUS => {
                let status = msg
                    .str_field("status")
                    .ok_or_else(|| HubError::missing_field("status"))?;
                let status = ParticipantStatus::parse(status)
                    .ok_or_else(|| HubError::Validation(format!("unknown status '{status}'")))?;
                self.state.services.update_status(&service.id, status).await;
                let response = Message::reply(
                    types::SERVICE_STATUS_UPDATED,
                    json!({ "serviceId": service.id, "status": status.as_str() }),
                    msg.id,
                );
                self.state.service_endpoint.send(connection_id, response);
                Ok(())
            }
            types::PONG => {
                if service.status == ParticipantStatus::Error {
                    self.state
                        .services
                        .update_status(&service.id, ParticipantStatus::Online)
                        .await;
                }
                Ok(())
            }
            types::ERROR => {
                debug!(
                    service = %service.id,
                    error = msg.str_field("error").unwrap_or_default(),
                    "error reported by service"
                );
                Ok(())
            }
            other => Err(HubError::Unsupported(other.to_string())),
        }
    }

    async fn service_register(&self, connection_id: Uuid, msg: &Message) -> HubResult<()> {
        let name = msg
            .str_field("serviceName")
            .or_else(|| msg.str_field("name"))
            .ok_or_else(|| HubError::missing_field("serviceName"))?;
        let capabilities = msg.str_list_field("capabilities");
        let tools: Option<Vec<ToolDescriptor>> = match msg.content.get("tools") {
            Some(raw) if !raw.is_null() => Some(
                serde_json::from_value(raw.clone())
                    .map_err(|e| HubError::Validation(format!("malformed tools list: {e}")))?,
            ),
            _ => None,
        };

        let registration = self
            .state
            .services
            .register(name, capabilities, tools, connection_id)
            .await;
        let service = &registration.service;
        info!(
            service = %service.id,
            name = %service.name,
            tools = service.tools.len(),
            "service registered"
        );

        let response = Message::reply(
            types::SERVICE_REGISTERED,
            json!({
                "serviceId": service.id,
                "name": service.name,
                "capabilities": service.capabilities,
                "status": service.status.as_str(),
            }),
            msg.id,
        );
        self.state.service_endpoint.send(connection_id, response);
        Ok(())
    }
}
