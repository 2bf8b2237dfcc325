//! idds-adapters: implementaciones concretas de los contratos externos.
//!
//! El core sólo conoce `TaskDriver` y `MetadataResolver`; acá viven las
//! implementaciones. La variante simulada (`sim`) es determinista y
//! scripteable: la usan los tests de los agentes y el binario demo. Los
//! adaptadores reales (PanDA, HTCondor, Rucio) se registran en tiempo de
//! compilación del lado del binario, nunca por carga dinámica.

pub mod sim;

pub use sim::{SimDatasetCatalog, SimWorkloadManager};
