/**
 * MODELS - Messages du protocole de présence et du canal de requêtes par hôte
 *
 * Contrats basés sur hosts.isalive@v1, hosts.isdead@v1, hosts.announce@v1
 * et hosts.request@v1. Tout passe en JSON sur les topics MQTT.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type HostId = Uuid;
pub type ObjectId = Uuid;

pub const ISALIVE_TOPIC: &str = "orbion/hosts/isalive@v1";
pub const ISDEAD_TOPIC: &str = "orbion/hosts/isdead@v1";
pub const ANNOUNCE_TOPIC: &str = "orbion/hosts/announce@v1";

pub fn host_request_topic(host_id: HostId) -> String {
    format!("orbion/hosts/{host_id}/request@v1")
}

pub fn client_reply_topic(client_id: Uuid) -> String {
    format!("orbion/clients/{client_id}/reply@v1")
}

/// Heartbeat périodique émis par chaque hôte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsAlive {
    pub host_id: HostId,
    pub ip: String,
    pub sent_at: String, // RFC3339
}

/// Émis une seule fois lors d'un arrêt propre : retrait immédiat du roster,
/// sans attendre le timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsDead {
    pub host_id: HostId,
}

/// Diffusé par le détecteur au démarrage pour forcer une vague de heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub caller_id: Uuid,
}

/// Sorte de paramètre attendue par une méthode distante. `Any` accepte tout
/// mais est moins spécifique qu'une correspondance exacte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Bool,
    Number,
    String,
    Array,
    Object,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamKind>,
}

/// Descripteur d'un objet déployable : son kind (handler natif côté agent),
/// ses méthodes déclarées et sa capacité à migrer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub kind: String,
    pub methods: Vec<MethodDescriptor>,
    #[serde(default = "default_transferable")]
    pub transferable: bool,
}

fn default_transferable() -> bool {
    true
}

/// `reply_to` vide signifie fire-and-forget : l'agent n'émet pas de réponse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: Uuid,
    pub reply_to: String,
    pub request: HostRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    Deploy {
        descriptor: ObjectDescriptor,
        args: Vec<Value>,
    },
    Destroy {
        object_id: ObjectId,
    },
    Invoke {
        object_id: ObjectId,
        method: String,
        args: Vec<Value>,
    },
    GetField {
        object_id: ObjectId,
        field: String,
    },
    SetField {
        object_id: ObjectId,
        field: String,
        value: Value,
    },
    /// Signal de vivacité au niveau objet : les clients sont toujours actifs,
    /// l'hôte ne doit pas expirer localement ses objets.
    Refresh,
    Serialize {
        object_id: ObjectId,
    },
    DeployMigrated {
        object_id: ObjectId,
        descriptor: ObjectDescriptor,
        state: Vec<u8>,
    },
    /// Retrait côté source après migration confirmée (jamais exposé aux
    /// appelants du pool).
    RemoveMigrated {
        object_id: ObjectId,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: Uuid,
    pub reply: HostReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostReply {
    Deployed { object_id: ObjectId },
    Done,
    Value { value: Value },
    State { bytes: Vec<u8> },
    Error { message: String },
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_roundtrip() {
        let env = RequestEnvelope {
            correlation_id: Uuid::new_v4(),
            reply_to: client_reply_topic(Uuid::new_v4()),
            request: HostRequest::Invoke {
                object_id: Uuid::new_v4(),
                method: "increment".into(),
                args: vec![serde_json::json!(3)],
            },
        };
        let txt = serde_json::to_string(&env).unwrap();
        let back: RequestEnvelope = serde_json::from_str(&txt).unwrap();
        assert_eq!(back.correlation_id, env.correlation_id);
        assert!(matches!(back.request, HostRequest::Invoke { .. }));
    }

    #[test]
    fn descriptor_transferable_defaults_true() {
        let d: ObjectDescriptor =
            serde_json::from_str(r#"{"kind":"counter","methods":[]}"#).unwrap();
        assert!(d.transferable);
    }
}
