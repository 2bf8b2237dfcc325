//! Condiciones entre Works como valores etiquetados.
//!
//! Los predicados de usuario del diseño original eran funciones libres
//! ligadas a objetos Work; acá son un enum cerrado despachado por tag, de
//! modo que la serialización del workflow no transporte código.

use serde::{Deserialize, Serialize};

use super::work::Work;

/// Predicado evaluado sobre el Work origen de la condición.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionTrigger {
    IsFinished,
    IsSubfinished,
    IsFailed,
    IsTerminated,
    /// Dispara cuando el Work terminado pide otra vuelta del lazo
    /// generador/actuador (bandera `generate_new_task` de su estado).
    GenerateNewTask,
    /// Bandera booleana con nombre dentro del estado del Work.
    Custom(String),
}

impl ConditionTrigger {
    pub fn evaluate(&self, work: &Work) -> bool {
        match self {
            Self::IsFinished => work.is_finished(),
            Self::IsSubfinished => work.is_subfinished(),
            Self::IsFailed => work.is_failed(),
            Self::IsTerminated => work.is_terminated(),
            Self::GenerateNewTask => work.is_terminated() && work.data.generate_new_task,
            Self::Custom(name) => work.data.custom_flags.get(name).copied().unwrap_or(false),
        }
    }
}

/// Arista condicional del DAG: cuando `current_work` termina se evalúa el
/// predicado y se instancia la rama que corresponda.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCondition {
    /// Template id del Work observado.
    pub current_work: String,
    pub trigger: ConditionTrigger,
    pub true_work: Option<String>,
    pub false_work: Option<String>,
}

impl WorkCondition {
    pub fn new(current_work: &str, trigger: ConditionTrigger, true_work: Option<&str>, false_work: Option<&str>) -> Self {
        Self { current_work: current_work.to_string(),
               trigger,
               true_work: true_work.map(str::to_string),
               false_work: false_work.map(str::to_string) }
    }
}
