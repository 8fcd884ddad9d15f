/*!
# Orbion DevKit - Bus mémoire et harnais de test

Bibliothèque facilitant le développement et le test du plan de contrôle :
- Broker en mémoire implémentant le contrat de bus, sans broker MQTT réel
- Harnais de test : agents embarqués, pool préconfiguré, helpers d'attente
*/

pub mod harness;
pub mod memory_bus;

pub use harness::TestHarness;
pub use memory_bus::{MemoryBroker, MemoryBus};
