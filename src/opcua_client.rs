//! OPC UA client for the lab's automation server
//!
//! One connection serves both node reads for `get_opcua_nodes` and the
//! published session state. It is opened on first use and reused until
//! [`OpcUaClient::close`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opcua::client::{ClientBuilder, IdentityToken, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    AttributeId, DataValue, MessageSecurityMode, NodeId, ReadValueId, TimestampsToReturn,
    UserTokenPolicy, Variant, WriteValue,
};
use serde_json::{Value, json};
use tokio::sync::OnceCell;

use crate::telemetry::TelemetrySink;
use crate::tools::NodeReader;
use crate::{Error, Result};

const APPLICATION_NAME: &str = "Parley Assistant";
const APPLICATION_URI: &str = "urn:ParleyAssistant";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_RETRY_LIMIT: i32 = 3;

/// Anonymous, unsecured client session to one server
pub struct OpcUaClient {
    url: String,
    session: OnceCell<Arc<Session>>,
}

impl OpcUaClient {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            session: OnceCell::new(),
        }
    }

    /// Server endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn session(&self) -> Result<&Arc<Session>> {
        self.session.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<Arc<Session>> {
        let mut client = ClientBuilder::new()
            .application_name(APPLICATION_NAME)
            .application_uri(APPLICATION_URI)
            .product_uri(APPLICATION_URI)
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .pki_dir(std::env::temp_dir().join("parley-pki"))
            .session_retry_limit(SESSION_RETRY_LIMIT)
            .client()
            .map_err(|errors| Error::OpcUa(format!("invalid client setup: {}", errors.join("; "))))?;

        let (session, event_loop) = client
            .connect_to_matching_endpoint(
                (
                    self.url.as_str(),
                    SecurityPolicy::None.to_str(),
                    MessageSecurityMode::None,
                    UserTokenPolicy::anonymous(),
                ),
                IdentityToken::Anonymous,
            )
            .await
            .map_err(|e| Error::OpcUa(format!("cannot reach {}: {e}", self.url)))?;
        event_loop.spawn();

        tokio::time::timeout(CONNECT_TIMEOUT, session.wait_for_connection())
            .await
            .map_err(|_| Error::OpcUa(format!("timed out connecting to {}", self.url)))?;

        tracing::info!(url = %self.url, "connected to OPC UA server");
        Ok(session)
    }

    /// Disconnect if a session was ever opened
    pub async fn close(&self) {
        if let Some(session) = self.session.get() {
            match session.disconnect().await {
                Ok(()) => tracing::info!(url = %self.url, "disconnected from OPC UA server"),
                Err(e) => tracing::warn!(url = %self.url, error = %e, "OPC UA disconnect failed"),
            }
        }
    }
}

#[async_trait]
impl NodeReader for OpcUaClient {
    async fn connect(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn read(&self, node_id: &str) -> Result<Value> {
        let id = parse_node_id(node_id).map_err(Error::OpcUa)?;
        let session = self.session().await?;

        let values = session
            .read(&[ReadValueId::from(id)], TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|e| Error::OpcUa(format!("read of {node_id} failed: {e}")))?;
        let value = values
            .into_iter()
            .next()
            .ok_or_else(|| Error::OpcUa(format!("no value returned for {node_id}")))?;

        data_value_to_json(node_id, value)
    }
}

#[async_trait]
impl TelemetrySink for OpcUaClient {
    async fn connect(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let node_id = parse_node_id(key).map_err(Error::Telemetry)?;
        let session = self.session().await?;

        let request = WriteValue {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: Default::default(),
            value: DataValue::value_only(Variant::from(value.to_string())),
        };
        let statuses = session
            .write(&[request])
            .await
            .map_err(|e| Error::Telemetry(format!("write to {key} failed: {e}")))?;

        match statuses.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(Error::Telemetry(format!("write to {key} rejected: {status}"))),
            None => Err(Error::Telemetry(format!("no status returned for {key}"))),
        }
    }

    async fn close(&self) {
        OpcUaClient::close(self).await;
    }
}

fn parse_node_id(node_id: &str) -> std::result::Result<NodeId, String> {
    node_id
        .parse::<NodeId>()
        .map_err(|_| format!("invalid node id '{node_id}'"))
}

fn data_value_to_json(node_id: &str, value: DataValue) -> Result<Value> {
    if let Some(status) = value.status.filter(|s| s.is_bad()) {
        return Err(Error::OpcUa(format!("read of {node_id} returned {status}")));
    }
    Ok(value.value.as_ref().map_or(Value::Null, variant_to_json))
}

/// Scalars map to their JSON counterparts, anything else to its display form
fn variant_to_json(variant: &Variant) -> Value {
    match variant {
        Variant::Empty => Value::Null,
        Variant::Boolean(v) => json!(v),
        Variant::SByte(v) => json!(v),
        Variant::Byte(v) => json!(v),
        Variant::Int16(v) => json!(v),
        Variant::UInt16(v) => json!(v),
        Variant::Int32(v) => json!(v),
        Variant::UInt32(v) => json!(v),
        Variant::Int64(v) => json!(v),
        Variant::UInt64(v) => json!(v),
        Variant::Float(v) => json!(f64::from(*v)),
        Variant::Double(v) => json!(v),
        Variant::String(s) if s.is_null() => Value::Null,
        Variant::String(s) => Value::String(s.to_string()),
        other => Value::String(other.to_string()),
    }
}
