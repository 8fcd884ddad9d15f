//! Orbion Host Agent - Worker-side agent hosting remote objects
//!
//! The agent is the worker half of the control plane:
//! - periodic heartbeats on the presence topic, immediate heartbeat on an
//!   announce request, a single goodbye message on graceful shutdown
//! - serves the per-host request channel: deploy, destroy, invoke,
//!   get/set field, refresh, serialize, deploy-migrated, remove, shutdown
//! - object kinds are registered native handlers; a built-in `counter`
//!   kind ships for demos and tests

use orbion_kernel::bus::Bus;
use orbion_kernel::models::{
    host_request_topic, now_rfc3339, AnnounceRequest, HostId, HostReply, HostRequest, IsAlive,
    IsDead, ObjectDescriptor, ObjectId, ReplyEnvelope, RequestEnvelope, ANNOUNCE_TOPIC,
    ISALIVE_TOPIC, ISDEAD_TOPIC,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A live object instance hosted by this agent. Handlers are plain native
/// state machines, invoked under the agent's object table lock.
pub trait ObjectHandler: Send {
    fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, String>;
    fn get_field(&self, field: &str) -> Result<Value, String>;
    fn set_field(&mut self, field: &str, value: Value) -> Result<(), String>;
    fn serialize(&self) -> Result<Vec<u8>, String>;
}

/// Factory for a registered object kind: fresh instances for deploys,
/// restored instances for migrations.
pub trait ObjectKind: Send + Sync {
    fn create(&self, args: &[Value]) -> Result<Box<dyn ObjectHandler>, String>;
    fn restore(&self, state: &[u8]) -> Result<Box<dyn ObjectHandler>, String>;
}

struct ManagedObject {
    handler: Box<dyn ObjectHandler>,
    descriptor: ObjectDescriptor,
}

/// Built-in demo kind: a counter with `increment`, `add(n)` and `get`, and
/// a readable/writable `value` field. State serializes as plain JSON.
pub struct CounterKind;

struct CounterHandler {
    value: i64,
}

impl ObjectHandler for CounterHandler {
    fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, String> {
        match (method, args) {
            ("increment", []) => {
                self.value += 1;
                Ok(Value::from(self.value))
            }
            ("add", [n]) => {
                let n = n.as_i64().ok_or("add expects an integer")?;
                self.value += n;
                Ok(Value::from(self.value))
            }
            ("get", []) => Ok(Value::from(self.value)),
            _ => Err(format!("counter has no method {method}/{}", args.len())),
        }
    }

    fn get_field(&self, field: &str) -> Result<Value, String> {
        match field {
            "value" => Ok(Value::from(self.value)),
            _ => Err(format!("counter has no field {field}")),
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<(), String> {
        match field {
            "value" => {
                self.value = value.as_i64().ok_or("value must be an integer")?;
                Ok(())
            }
            _ => Err(format!("counter has no field {field}")),
        }
    }

    fn serialize(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.value).map_err(|e| e.to_string())
    }
}

impl ObjectKind for CounterKind {
    fn create(&self, args: &[Value]) -> Result<Box<dyn ObjectHandler>, String> {
        let value = match args {
            [] => 0,
            [n] => n.as_i64().ok_or("counter takes an integer initial value")?,
            _ => return Err("counter takes at most one argument".into()),
        };
        Ok(Box::new(CounterHandler { value }))
    }

    fn restore(&self, state: &[u8]) -> Result<Box<dyn ObjectHandler>, String> {
        let value = serde_json::from_slice(state).map_err(|e| e.to_string())?;
        Ok(Box::new(CounterHandler { value }))
    }
}

pub struct HostAgent {
    host_id: HostId,
    ip: String,
    heartbeat_interval: Duration,
    kinds: HashMap<String, Arc<dyn ObjectKind>>,
    objects: parking_lot::Mutex<HashMap<ObjectId, ManagedObject>>,
    stop: Notify,
}

impl HostAgent {
    pub fn new(ip: impl Into<String>, heartbeat_interval: Duration) -> Self {
        let mut kinds: HashMap<String, Arc<dyn ObjectKind>> = HashMap::new();
        kinds.insert("counter".into(), Arc::new(CounterKind));
        Self {
            host_id: Uuid::new_v4(),
            ip: ip.into(),
            heartbeat_interval,
            kinds,
            objects: parking_lot::Mutex::new(HashMap::new()),
            stop: Notify::new(),
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Enregistre un kind supplémentaire. À faire avant `run`.
    pub fn register_kind(&mut self, name: impl Into<String>, kind: Arc<dyn ObjectKind>) {
        self.kinds.insert(name.into(), kind);
    }

    pub fn hosted_object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Demande d'arrêt locale (Ctrl-C du binaire, harnais de test). Le
    /// permis est retenu : un stop émis entre deux tours de boucle compte.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    async fn send_heartbeat(&self, bus: &dyn Bus) {
        let hb = IsAlive {
            host_id: self.host_id,
            ip: self.ip.clone(),
            sent_at: now_rfc3339(),
        };
        match serde_json::to_vec(&hb) {
            Ok(payload) => {
                if let Err(e) = bus.publish(ISALIVE_TOPIC, payload).await {
                    warn!("heartbeat publish failed: {e}");
                }
            }
            Err(e) => warn!("heartbeat encode failed: {e}"),
        }
    }

    /// Boucle principale : heartbeats périodiques, réponse immédiate aux
    /// demandes d'annonce, traitement du canal de requêtes. Retourne après
    /// un Shutdown distant ou un `stop()` local, en publiant l'adieu.
    pub async fn run(self: Arc<Self>, bus: Arc<dyn Bus>) -> anyhow::Result<()> {
        let mut announce_sub = bus.subscribe(ANNOUNCE_TOPIC).await?;
        let mut request_sub = bus.subscribe(&host_request_topic(self.host_id)).await?;
        info!("host agent {} online (ip={})", self.host_id, self.ip);

        // première annonce immédiate, le détecteur n'attend pas un intervalle
        self.send_heartbeat(bus.as_ref()).await;
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.send_heartbeat(bus.as_ref()).await;
                }
                msg = announce_sub.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_slice::<AnnounceRequest>(&msg.payload) {
                        Ok(req) => {
                            debug!("announce request from {}", req.caller_id);
                            self.send_heartbeat(bus.as_ref()).await;
                        }
                        Err(e) => warn!("malformed announce request: {e}"),
                    }
                }
                msg = request_sub.recv() => {
                    let Some(msg) = msg else { break };
                    let envelope = match serde_json::from_slice::<RequestEnvelope>(&msg.payload) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!("malformed request on {}: {e}", msg.topic);
                            continue;
                        }
                    };
                    let shutting_down = matches!(envelope.request, HostRequest::Shutdown);
                    let reply = self.handle_request(envelope.request);
                    // reply_to vide = fire-and-forget, pas de réponse
                    if !envelope.reply_to.is_empty() {
                        let out = ReplyEnvelope {
                            correlation_id: envelope.correlation_id,
                            reply,
                        };
                        match serde_json::to_vec(&out) {
                            Ok(payload) => {
                                if let Err(e) = bus.publish(&envelope.reply_to, payload).await {
                                    warn!("reply publish failed: {e}");
                                }
                            }
                            Err(e) => warn!("reply encode failed: {e}"),
                        }
                    }
                    if shutting_down {
                        break;
                    }
                }
                _ = self.stop.notified() => {
                    break;
                }
            }
        }

        self.say_goodbye(bus.as_ref()).await;
        info!("host agent {} stopped", self.host_id);
        Ok(())
    }

    /// Adieu unique : retrait immédiat du roster sans attendre le timeout.
    async fn say_goodbye(&self, bus: &dyn Bus) {
        let dead = IsDead { host_id: self.host_id };
        match serde_json::to_vec(&dead) {
            Ok(payload) => {
                if let Err(e) = bus.publish(ISDEAD_TOPIC, payload).await {
                    warn!("goodbye publish failed: {e}");
                }
            }
            Err(e) => warn!("goodbye encode failed: {e}"),
        }
    }

    /// Traitement synchrone d'une requête du kernel. Toute erreur devient un
    /// `HostReply::Error`, jamais une absence de réponse.
    pub fn handle_request(&self, request: HostRequest) -> HostReply {
        match self.try_handle(request) {
            Ok(reply) => reply,
            Err(message) => HostReply::Error { message },
        }
    }

    fn try_handle(&self, request: HostRequest) -> Result<HostReply, String> {
        match request {
            HostRequest::Deploy { descriptor, args } => {
                let kind = self
                    .kinds
                    .get(&descriptor.kind)
                    .ok_or_else(|| format!("unknown object kind {}", descriptor.kind))?;
                let handler = kind.create(&args)?;
                let object_id = Uuid::new_v4();
                self.objects
                    .lock()
                    .insert(object_id, ManagedObject { handler, descriptor });
                info!("deployed object {object_id}");
                Ok(HostReply::Deployed { object_id })
            }
            HostRequest::Destroy { object_id } => {
                self.objects
                    .lock()
                    .remove(&object_id)
                    .ok_or_else(|| format!("no object {object_id} on this host"))?;
                info!("destroyed object {object_id}");
                Ok(HostReply::Done)
            }
            HostRequest::Invoke { object_id, method, args } => {
                let mut objects = self.objects.lock();
                let obj = objects
                    .get_mut(&object_id)
                    .ok_or_else(|| format!("no object {object_id} on this host"))?;
                let value = obj.handler.invoke(&method, &args)?;
                Ok(HostReply::Value { value })
            }
            HostRequest::GetField { object_id, field } => {
                let objects = self.objects.lock();
                let obj = objects
                    .get(&object_id)
                    .ok_or_else(|| format!("no object {object_id} on this host"))?;
                Ok(HostReply::Value { value: obj.handler.get_field(&field)? })
            }
            HostRequest::SetField { object_id, field, value } => {
                let mut objects = self.objects.lock();
                let obj = objects
                    .get_mut(&object_id)
                    .ok_or_else(|| format!("no object {object_id} on this host"))?;
                obj.handler.set_field(&field, value)?;
                Ok(HostReply::Done)
            }
            HostRequest::Refresh => {
                debug!("refresh received, {} objects hosted", self.objects.lock().len());
                Ok(HostReply::Done)
            }
            HostRequest::Serialize { object_id } => {
                let objects = self.objects.lock();
                let obj = objects
                    .get(&object_id)
                    .ok_or_else(|| format!("no object {object_id} on this host"))?;
                if !obj.descriptor.transferable {
                    return Err(format!("object {object_id} is not transferable"));
                }
                Ok(HostReply::State { bytes: obj.handler.serialize()? })
            }
            HostRequest::DeployMigrated { object_id, descriptor, state } => {
                let kind = self
                    .kinds
                    .get(&descriptor.kind)
                    .ok_or_else(|| format!("unknown object kind {}", descriptor.kind))?;
                let handler = kind.restore(&state)?;
                self.objects
                    .lock()
                    .insert(object_id, ManagedObject { handler, descriptor });
                info!("reconstructed migrated object {object_id}");
                Ok(HostReply::Done)
            }
            HostRequest::RemoveMigrated { object_id } => {
                if self.objects.lock().remove(&object_id).is_some() {
                    info!("dropped migrated-away object {object_id}");
                }
                Ok(HostReply::Done)
            }
            HostRequest::Shutdown => {
                info!("shutdown requested by kernel");
                Ok(HostReply::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbion_kernel::models::{MethodDescriptor, ParamKind};
    use serde_json::json;

    fn counter_descriptor(transferable: bool) -> ObjectDescriptor {
        ObjectDescriptor {
            kind: "counter".into(),
            methods: vec![
                MethodDescriptor { name: "increment".into(), params: vec![] },
                MethodDescriptor { name: "add".into(), params: vec![ParamKind::Number] },
                MethodDescriptor { name: "get".into(), params: vec![] },
            ],
            transferable,
        }
    }

    fn agent() -> HostAgent {
        HostAgent::new("127.0.0.1", Duration::from_secs(30))
    }

    fn deploy(agent: &HostAgent, transferable: bool) -> ObjectId {
        match agent.handle_request(HostRequest::Deploy {
            descriptor: counter_descriptor(transferable),
            args: vec![],
        }) {
            HostReply::Deployed { object_id } => object_id,
            other => panic!("unexpected deploy reply: {other:?}"),
        }
    }

    #[test]
    fn counter_lifecycle() {
        let agent = agent();
        let id = deploy(&agent, true);

        let reply = agent.handle_request(HostRequest::Invoke {
            object_id: id,
            method: "increment".into(),
            args: vec![],
        });
        assert!(matches!(reply, HostReply::Value { value } if value == json!(1)));

        let reply = agent.handle_request(HostRequest::Invoke {
            object_id: id,
            method: "add".into(),
            args: vec![json!(41)],
        });
        assert!(matches!(reply, HostReply::Value { value } if value == json!(42)));

        let reply = agent.handle_request(HostRequest::GetField {
            object_id: id,
            field: "value".into(),
        });
        assert!(matches!(reply, HostReply::Value { value } if value == json!(42)));

        agent.handle_request(HostRequest::Destroy { object_id: id });
        assert_eq!(agent.hosted_object_count(), 0);
    }

    #[test]
    fn destroy_unknown_object_is_an_error() {
        let agent = agent();
        let reply = agent.handle_request(HostRequest::Destroy { object_id: Uuid::new_v4() });
        assert!(matches!(reply, HostReply::Error { .. }));
    }

    #[test]
    fn non_transferable_object_refuses_serialization() {
        let agent = agent();
        let id = deploy(&agent, false);
        let reply = agent.handle_request(HostRequest::Serialize { object_id: id });
        let HostReply::Error { message } = reply else {
            panic!("expected deterministic serialization failure");
        };
        assert!(message.contains("not transferable"));
        // l'objet reste intact
        assert_eq!(agent.hosted_object_count(), 1);
    }

    #[test]
    fn migrated_state_roundtrips_through_restore() {
        let source = agent();
        let target = agent();
        let id = deploy(&source, true);
        source.handle_request(HostRequest::Invoke {
            object_id: id,
            method: "add".into(),
            args: vec![json!(7)],
        });

        let HostReply::State { bytes } =
            source.handle_request(HostRequest::Serialize { object_id: id })
        else {
            panic!("expected serialized state");
        };
        let reply = target.handle_request(HostRequest::DeployMigrated {
            object_id: id,
            descriptor: counter_descriptor(true),
            state: bytes,
        });
        assert!(matches!(reply, HostReply::Done));

        let reply = target.handle_request(HostRequest::GetField {
            object_id: id,
            field: "value".into(),
        });
        assert!(matches!(reply, HostReply::Value { value } if value == json!(7)));
    }
}
