//! Motor de workflow: DAG de Works con condiciones.
//!
//! El motor nunca hace IO; es una función pura de su estado cargado más los
//! `sync_work_data` que le inyectan los agentes. El split estático/dinámico
//! es parte del contrato: la estructura (templates, condiciones) vive en
//! `request_metadata.workflow`, el estado mutable en
//! `processing_metadata.workflow_data`, y ambos se recombinan en la lectura.

mod condition;
mod work;

pub use condition::{ConditionTrigger, WorkCondition};
pub use work::{CollectionSpec, ContentSeed, JobDependency, JobSpec, MapCollections, NewIoMap, RegisteredMap,
               ResolvedDep, Work, WorkData};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use idds_common::{IddsError, RequestStatus, TransformStatus};

/// Estado mutable del workflow, serializado aparte de la estructura.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowData {
    /// Instancias por id de instancia (`template:seq`).
    pub works: BTreeMap<String, WorkInstance>,
    /// Cantidad de instancias creadas por template.
    pub sequences: BTreeMap<String, u32>,
    /// Claves `condIdx@instancia` de condiciones ya disparadas.
    pub fired: Vec<String>,
}

/// Una instancia de Work: referencia al template más su mitad dinámica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkInstance {
    pub template_id: String,
    pub data: WorkData,
}

/// DAG de Works con condiciones, claveado por ids internos estables.
///
/// Los bordes entre Works son ids, nunca punteros: los ciclos
/// generador/actuador se recorren con sets de visitados explícitos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    /// Nodos blueprint. Nunca mutan después de la construcción.
    pub works_template: BTreeMap<String, Work>,
    pub conditions: Vec<WorkCondition>,
    /// Set inicial cuando la independencia no se puede derivar sola.
    pub initial_works: Vec<String>,
    #[serde(skip)]
    data: WorkflowData,
}

impl Workflow {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(),
               works_template: BTreeMap::new(),
               conditions: Vec::new(),
               initial_works: Vec::new(),
               data: WorkflowData::default() }
    }

    pub fn add_work(&mut self, work: Work, initial: bool) {
        let id = work.internal_id.clone();
        if initial {
            self.initial_works.push(id.clone());
        }
        self.works_template.insert(id, work);
    }

    pub fn add_condition(&mut self, condition: WorkCondition) {
        self.conditions.push(condition);
    }

    /// Valida que las condiciones referencien templates existentes.
    pub fn validate(&self) -> Result<(), IddsError> {
        for cond in &self.conditions {
            for id in [Some(&cond.current_work), cond.true_work.as_ref(), cond.false_work.as_ref()].into_iter()
                                                                                                   .flatten()
            {
                if !self.works_template.contains_key(id) {
                    return Err(IddsError::Validation(format!("condition references unknown work {id}")));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // split estático/dinámico
    // ------------------------------------------------------------------

    /// Mitad dinámica para persistir en `processing_metadata.workflow_data`.
    pub fn get_running_data(&self) -> WorkflowData {
        self.data.clone()
    }

    /// Reincorpora la mitad dinámica leída del almacén. Idempotente.
    pub fn load_running_data(&mut self, data: WorkflowData) {
        self.data = data;
    }

    // ------------------------------------------------------------------
    // instancias
    // ------------------------------------------------------------------

    fn instance_id(template_id: &str, seq: u32) -> String {
        format!("{template_id}:{seq}")
    }

    /// Reconstruye el Work completo (template + data) de una instancia.
    pub fn instantiated(&self, instance_id: &str) -> Option<Work> {
        let inst = self.data.works.get(instance_id)?;
        let template = self.works_template.get(&inst.template_id)?;
        let mut work = template.clone();
        work.data = inst.data.clone();
        Some(work)
    }

    /// Última instancia creada de un template, si existe.
    fn latest_instance_id(&self, template_id: &str) -> Option<String> {
        let seq = *self.data.sequences.get(template_id)?;
        if seq == 0 {
            return None;
        }
        Some(Self::instance_id(template_id, seq - 1))
    }

    fn instantiate(&mut self, template_id: &str) -> Option<String> {
        let template = self.works_template.get(template_id)?;
        let seq = *self.data.sequences.get(template_id).unwrap_or(&0);
        let id = Self::instance_id(template_id, seq);
        let mut data = WorkData::default();
        data.sequence_id = seq;
        data.dependency_map = template.dependency_map_template.clone();
        self.data.works.insert(id.clone(),
                               WorkInstance { template_id: template_id.to_string(),
                                              data });
        self.data.sequences.insert(template_id.to_string(), seq + 1);
        Some(id)
    }

    /// Templates de arranque: `initial_works` si fue provisto, si no los que
    /// no aparecen como destino de ninguna condición.
    fn starting_templates(&self) -> Vec<String> {
        if !self.initial_works.is_empty() {
            return self.initial_works.clone();
        }
        let targets: Vec<&String> = self.conditions
                                        .iter()
                                        .flat_map(|c| c.true_work.iter().chain(c.false_work.iter()))
                                        .collect();
        self.works_template
            .keys()
            .filter(|id| !targets.contains(id))
            .cloned()
            .collect()
    }

    /// Instanciaciones pendientes sin mutar estado: arranques no creados y
    /// condiciones disparables sobre instancias terminadas.
    fn pending_instantiations(&self) -> Vec<(String, Option<String>)> {
        let mut pending = Vec::new();
        for template_id in self.starting_templates() {
            if self.data.sequences.get(&template_id).copied().unwrap_or(0) == 0 {
                pending.push((template_id, None));
            }
        }
        for (idx, cond) in self.conditions.iter().enumerate() {
            let Some(source_id) = self.latest_instance_id(&cond.current_work) else {
                continue;
            };
            let fired_key = format!("{idx}@{source_id}");
            if self.data.fired.contains(&fired_key) {
                continue;
            }
            let Some(source) = self.instantiated(&source_id) else {
                continue;
            };
            if !source.is_terminated() {
                continue;
            }
            let branch = if cond.trigger.evaluate(&source) {
                cond.true_work.clone()
            } else {
                cond.false_work.clone()
            };
            if let Some(target) = branch {
                pending.push((target, Some(fired_key)));
            } else {
                // rama sin destino: la condición queda consumida igual
                pending.push((String::new(), Some(fired_key)));
            }
        }
        pending
    }

    // ------------------------------------------------------------------
    // operaciones del Clerk
    // ------------------------------------------------------------------

    /// Works cuyas precondiciones se cumplieron pero que aún no fueron
    /// convertidos en Transforms. Instancia los nodos que correspondan.
    pub fn get_new_works(&mut self) -> Vec<(String, Work)> {
        for (template_id, fired_key) in self.pending_instantiations() {
            if let Some(key) = fired_key {
                self.data.fired.push(key);
            }
            if !template_id.is_empty() {
                self.instantiate(&template_id);
            }
        }
        self.data
            .works
            .iter()
            .filter(|(_, inst)| inst.data.work_id.is_none())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| self.instantiated(&id).map(|w| (id, w)))
            .collect()
    }

    /// Works con un Transform activo (materializados).
    pub fn get_current_works(&self) -> Vec<(String, Work)> {
        self.data
            .works
            .iter()
            .filter(|(_, inst)| inst.data.work_id.is_some())
            .filter_map(|(id, _)| self.instantiated(id).map(|w| (id.clone(), w)))
            .collect()
    }

    /// Registra el transform_id asignado a una instancia.
    pub fn set_work_id(&mut self, instance_id: &str, work_id: i64) {
        if let Some(inst) = self.data.works.get_mut(instance_id) {
            inst.data.work_id = Some(work_id);
        }
    }

    /// Fusiona el estado del Transform de vuelta en el nodo. Idempotente:
    /// aplicar dos veces el mismo sync produce el mismo estado.
    pub fn sync_work_data(&mut self,
                          work_id: i64,
                          status: TransformStatus,
                          substatus: Option<TransformStatus>,
                          mut work_data: WorkData) {
        for inst in self.data.works.values_mut() {
            if inst.data.work_id == Some(work_id) {
                work_data.work_id = Some(work_id);
                work_data.status = Some(status);
                work_data.substatus = substatus;
                inst.data = work_data;
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // predicados agregados
    // ------------------------------------------------------------------

    fn instance_statuses(&self) -> Vec<TransformStatus> {
        self.data
            .works
            .values()
            .map(|inst| inst.data.status.unwrap_or(TransformStatus::New))
            .collect()
    }

    /// Terminado: hay al menos una instancia, todas materializadas y en
    /// estado terminal, y ninguna condición puede disparar más trabajo.
    pub fn is_terminated(&self) -> bool {
        if self.data.works.is_empty() {
            return false;
        }
        let all_done = self.data.works.values().all(|inst| {
                                                  inst.data.work_id.is_some()
                                                  && inst.data.status.map(|s| s.is_terminal()).unwrap_or(false)
                                              });
        all_done && self.pending_instantiations().iter().all(|(t, _)| t.is_empty())
    }

    pub fn is_finished(&self) -> bool {
        self.is_terminated() && self.instance_statuses().iter().all(|s| *s == TransformStatus::Finished)
    }

    pub fn is_subfinished(&self) -> bool {
        let statuses = self.instance_statuses();
        self.is_terminated()
        && statuses.iter().any(|s| *s == TransformStatus::SubFinished)
        && statuses.iter()
                   .all(|s| matches!(s, TransformStatus::Finished | TransformStatus::SubFinished))
    }

    pub fn is_failed(&self) -> bool {
        self.is_terminated() && self.instance_statuses().iter().any(|s| *s == TransformStatus::Failed)
    }

    pub fn is_expired(&self) -> bool {
        self.is_terminated() && self.instance_statuses().iter().any(|s| *s == TransformStatus::Expired)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_terminated() && self.instance_statuses().iter().any(|s| *s == TransformStatus::Cancelled)
    }

    pub fn is_suspended(&self) -> bool {
        self.is_terminated() && self.instance_statuses().iter().any(|s| *s == TransformStatus::Suspended)
    }

    /// Estado de Request que corresponde al agregado actual. El orden de
    /// precedencia sigue al agregador del Clerk original.
    pub fn terminal_request_status(&self) -> Option<RequestStatus> {
        if !self.is_terminated() {
            return None;
        }
        Some(if self.is_finished() {
                 RequestStatus::Finished
             } else if self.is_subfinished() {
                 RequestStatus::SubFinished
             } else if self.is_failed() {
                 RequestStatus::Failed
             } else if self.is_expired() {
                 RequestStatus::Expired
             } else if self.is_cancelled() {
                 RequestStatus::Cancelled
             } else if self.is_suspended() {
                 RequestStatus::Suspended
             } else {
                 RequestStatus::Failed
             })
    }

    pub fn get_terminated_msg(&self) -> String {
        let parts: Vec<String> = self.data
                                     .works
                                     .iter()
                                     .map(|(id, inst)| {
                                         format!("{id}={:?}", inst.data.status.unwrap_or(TransformStatus::New))
                                     })
                                     .collect();
        format!("workflow {}: {}", self.name, parts.join(", "))
    }

    // ------------------------------------------------------------------
    // operaciones de control
    // ------------------------------------------------------------------

    /// Marca toresume en todas las instancias; los agentes aguas abajo
    /// consumen la bandera.
    pub fn resume_works(&mut self) {
        for inst in self.data.works.values_mut() {
            inst.data.toresume = true;
        }
    }

    pub fn cancel_works(&mut self) {
        for inst in self.data.works.values_mut() {
            if !inst.data.status.map(|s| s.is_terminal()).unwrap_or(false) {
                inst.data.tocancel = true;
            }
        }
    }

    pub fn suspend_works(&mut self) {
        for inst in self.data.works.values_mut() {
            if !inst.data.status.map(|s| s.is_terminal()).unwrap_or(false) {
                inst.data.tosuspend = true;
            }
        }
    }
}
