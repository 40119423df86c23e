/*!
# Perfwatch DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests de l'agent sans hôte ni base réels:
- Sonde OS scriptée (CPU, mémoire, disque, interfaces réseau)
- Store en mémoire avec injection de pannes
- Harness qui pilote la boucle d'ingestion tick par tick
*/

pub mod os_stub;
pub mod store_stub;
pub mod test_utils;

pub use os_stub::ScriptedProbe;
pub use store_stub::FaultyStore;
pub use test_utils::TestHarness;
