/**
 * ORBION KERNEL - Plan de contrôle d'une plateforme d'objets distribués
 *
 * RÔLE : Décider quel hôte worker héberge chaque objet distant, suivre la
 * vivacité des hôtes, créer/détruire des hôtes à la demande et migrer les
 * objets sans perdre le travail en cours.
 *
 * ARCHITECTURE : Détecteur de présence (heartbeats MQTT) + pool d'hôtes avec
 * verrous équitables par objet + coordinateur de migration + API REST.
 */

pub mod bus;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod hosts;
pub mod http;
pub mod migration;
pub mod models;
pub mod mqtt;
pub mod platform;
pub mod policy;
pub mod pool;
pub mod presence;
pub mod state;

pub use errors::{Error, Result};
