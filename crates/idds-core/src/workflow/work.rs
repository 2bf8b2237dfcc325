//! Work: un nodo lógico del workflow y su mitad dinámica.
//!
//! El blueprint (colecciones, parámetros de task, opt-in de dependencias)
//! nunca muta; todo lo que cambia durante la ejecución vive en `WorkData`,
//! que se serializa por separado (`running_metadata.work_data`). El
//! Transformer y el Carrier operan siempre sobre el Work recombinado.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use idds_common::{CollectionStatus, CollectionType, ContentRelationType, ContentStatus, ContentType, TransformStatus,
                  TransformType};

use crate::models::ContentRecord;

/// Colección declarada por el blueprint de un Work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub scope: String,
    pub name: String,
    pub coll_type: CollectionType,
}

impl CollectionSpec {
    pub fn new(scope: &str, name: &str, coll_type: CollectionType) -> Self {
        Self { scope: scope.to_string(),
               name: name.to_string(),
               coll_type }
    }

    pub fn is_pseudo(&self) -> bool {
        self.coll_type == CollectionType::PseudoDataset
    }
}

/// Dependencia de un job sobre un output de otro Work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub work_name: String,
    pub input_name: String,
}

/// Job pendiente de un Work con dependencias a nivel de archivo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub dependencies: Vec<JobDependency>,
}

/// Resultado de resolver una dependencia contra el catálogo: el Content de
/// salida aguas arriba que la desbloquea.
#[derive(Debug, Clone)]
pub struct ResolvedDep {
    pub content_id: i64,
    pub substatus: ContentStatus,
}

/// Semilla de Content a persistir por el Transformer.
#[derive(Debug, Clone)]
pub struct ContentSeed {
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    pub min_id: i32,
    pub max_id: i32,
    pub content_type: ContentType,
    pub content_relation_type: ContentRelationType,
    pub content_dep_id: Option<i64>,
    pub substatus: ContentStatus,
}

/// Mapa nuevo input→output para una unidad de ejecución.
#[derive(Debug, Clone, Default)]
pub struct NewIoMap {
    pub inputs: Vec<ContentSeed>,
    pub outputs: Vec<ContentSeed>,
    pub logs: Vec<ContentSeed>,
    pub inputs_dependency: Vec<ContentSeed>,
}

/// Mapa ya registrado, releído del catálogo y agrupado por `map_id`.
#[derive(Debug, Clone, Default)]
pub struct RegisteredMap {
    pub inputs: Vec<ContentRecord>,
    pub outputs: Vec<ContentRecord>,
    pub logs: Vec<ContentRecord>,
    pub inputs_dependency: Vec<ContentRecord>,
}

/// Referencias de colección que el Transformer resuelve antes de pedir
/// mapas nuevos (los ids sólo existen tras registrar las colecciones).
#[derive(Debug, Clone)]
pub struct MapCollections {
    pub input_coll_id: i64,
    pub input_scope: String,
    pub input_status: CollectionStatus,
    pub output_coll_id: i64,
    pub output_scope: String,
}

/// Mitad dinámica de un Work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkData {
    pub sequence_id: u32,
    /// transform_id una vez materializado.
    pub work_id: Option<i64>,
    /// Id externo del workload manager, espejo de la fila Processing.
    pub workload_id: Option<i64>,
    pub status: Option<TransformStatus>,
    pub substatus: Option<TransformStatus>,
    /// Mientras sea true el Transformer sigue pidiendo mapas nuevos.
    pub has_new_inputs: bool,
    /// Archivos de entrada descubiertos al pollear la colección primaria.
    pub input_files: Vec<String>,
    /// Jobs con dependencias sin resolver; se reintentan cada ciclo sin
    /// persistirse.
    pub dependency_map: Vec<JobSpec>,
    /// Jobs emitidos en la vuelta anterior, pendientes de confirmación.
    pub dependency_map_deleted: Vec<JobSpec>,
    pub retry_number: u32,
    pub generate_new_task: bool,
    pub custom_flags: BTreeMap<String, bool>,
    pub tocancel: bool,
    pub tosuspend: bool,
    pub toresume: bool,
    pub toexpire: bool,
    pub tofinish: bool,
    pub toforcefinish: bool,
}

impl Default for WorkData {
    fn default() -> Self {
        Self { sequence_id: 0,
               work_id: None,
               workload_id: None,
               status: None,
               substatus: None,
               has_new_inputs: true,
               input_files: Vec::new(),
               dependency_map: Vec::new(),
               dependency_map_deleted: Vec::new(),
               retry_number: 0,
               generate_new_task: false,
               custom_flags: BTreeMap::new(),
               tocancel: false,
               tosuspend: false,
               toresume: false,
               toexpire: false,
               tofinish: false,
               toforcefinish: false }
    }
}

/// Un Work: blueprint más estado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    /// Id interno estable dentro del workflow.
    pub internal_id: String,
    /// Nombre base de la task externa; la unicidad final agrega el
    /// transform_id (precondición de redescubrimiento por nombre).
    pub work_name: String,
    pub work_type: TransformType,
    pub work_tag: String,
    pub primary_input_collection: Option<CollectionSpec>,
    pub output_collections: Vec<CollectionSpec>,
    pub log_collections: Vec<CollectionSpec>,
    /// Payload de sumisión específico del backend (plantilla).
    pub task_params: Value,
    /// Opt-in a liberar jobs por dependencias a nivel de content.
    pub use_dependency: bool,
    /// Jobs declarados por el blueprint (works con dependencias).
    pub dependency_map_template: Vec<JobSpec>,
    /// Presupuesto de reintentos sobre SubFinished.
    pub num_retries: u32,
    #[serde(skip)]
    pub data: WorkData,
}

impl Work {
    pub fn new(internal_id: &str, work_name: &str, work_type: TransformType, work_tag: &str) -> Self {
        Self { internal_id: internal_id.to_string(),
               work_name: work_name.to_string(),
               work_type,
               work_tag: work_tag.to_string(),
               primary_input_collection: None,
               output_collections: Vec::new(),
               log_collections: Vec::new(),
               task_params: Value::Null,
               use_dependency: false,
               dependency_map_template: Vec::new(),
               num_retries: 0,
               data: WorkData::default() }
    }

    pub fn use_dependency_to_release_jobs(&self) -> bool {
        self.use_dependency
    }

    pub fn has_new_inputs(&self) -> bool {
        self.data.has_new_inputs
    }

    pub fn status(&self) -> TransformStatus {
        self.data.status.unwrap_or(TransformStatus::New)
    }

    pub fn is_terminated(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_finished(&self) -> bool {
        self.status() == TransformStatus::Finished
    }

    pub fn is_subfinished(&self) -> bool {
        self.status() == TransformStatus::SubFinished
    }

    pub fn is_failed(&self) -> bool {
        self.status() == TransformStatus::Failed
    }

    /// Nombre de task único por transform. La unicidad por nombre es la
    /// precondición del redescubrimiento de workload_id.
    pub fn unique_task_name(&self) -> String {
        match self.data.work_id {
            Some(id) => format!("{}_{}", self.work_name, id),
            None => self.work_name.clone(),
        }
    }

    // ------------------------------------------------------------------
    // generación de mapas
    // ------------------------------------------------------------------

    fn next_map_id(mapped: &BTreeMap<i64, RegisteredMap>) -> i64 {
        mapped.keys().max().map(|m| m + 1).unwrap_or(1)
    }

    fn input_seed(colls: &MapCollections, name: &str) -> ContentSeed {
        ContentSeed { coll_id: colls.input_coll_id,
                      scope: colls.input_scope.clone(),
                      name: name.to_string(),
                      min_id: 0,
                      max_id: 0,
                      content_type: ContentType::File,
                      content_relation_type: ContentRelationType::Input,
                      content_dep_id: None,
                      substatus: ContentStatus::New }
    }

    fn output_seed(colls: &MapCollections, name: &str) -> ContentSeed {
        ContentSeed { coll_id: colls.output_coll_id,
                      scope: colls.output_scope.clone(),
                      name: name.to_string(),
                      min_id: 0,
                      max_id: 0,
                      content_type: ContentType::File,
                      content_relation_type: ContentRelationType::Output,
                      content_dep_id: None,
                      substatus: ContentStatus::New }
    }

    /// Inputs nuevos que todavía no fueron mapeados a outputs.
    ///
    /// Para works con dependencias sólo se emite un mapa cuando todas sus
    /// `inputs_dependency` resuelven a Contents de salida existentes aguas
    /// arriba; los jobs no satisfechos quedan en memoria y se reintentan en
    /// el próximo ciclo sin persistirse.
    pub fn get_new_input_output_maps(&mut self,
                                     mapped: &BTreeMap<i64, RegisteredMap>,
                                     colls: &MapCollections,
                                     resolve_dep: &dyn Fn(&JobDependency) -> Option<ResolvedDep>)
                                     -> BTreeMap<i64, NewIoMap> {
        let mut new_maps = BTreeMap::new();
        let mut next_id = Self::next_map_id(mapped);

        if !self.use_dependency {
            let mapped_names: HashSet<&str> = mapped.values()
                                                    .flat_map(|m| m.inputs.iter())
                                                    .map(|c| c.name.as_str())
                                                    .collect();
            let pending: Vec<String> = self.data
                                           .input_files
                                           .iter()
                                           .filter(|n| !mapped_names.contains(n.as_str()))
                                           .cloned()
                                           .collect();
            if pending.is_empty() {
                if colls.input_status == CollectionStatus::Closed {
                    self.data.has_new_inputs = false;
                }
                return new_maps;
            }
            for name in pending {
                new_maps.insert(next_id,
                                NewIoMap { inputs: vec![Self::input_seed(colls, &name)],
                                           outputs: vec![Self::output_seed(colls, &name)],
                                           logs: Vec::new(),
                                           inputs_dependency: Vec::new() });
                next_id += 1;
            }
            return new_maps;
        }

        // works con dependencias: el blueprint declara la lista completa de
        // jobs; cuando se agota, no hay más inputs
        if self.data.dependency_map.is_empty() && self.data.dependency_map_deleted.is_empty() {
            self.data.has_new_inputs = false;
            return new_maps;
        }

        // jobs emitidos la vuelta pasada: los confirmados en el catálogo se
        // descartan, los que no llegaron se reintentan
        let mapped_out_names: HashSet<&str> = mapped.values()
                                                    .flat_map(|m| m.outputs.iter())
                                                    .map(|c| c.name.as_str())
                                                    .collect();
        let deleted = std::mem::take(&mut self.data.dependency_map_deleted);
        for job in deleted {
            if !mapped_out_names.contains(job.name.as_str()) {
                self.data.dependency_map.push(job);
            }
        }

        let pending = std::mem::take(&mut self.data.dependency_map);
        for job in pending {
            let resolved: Vec<Option<ResolvedDep>> = job.dependencies.iter().map(resolve_dep).collect();
            if resolved.iter().all(|r| r.is_some()) {
                let mut map = NewIoMap { inputs: vec![Self::input_seed(colls, &job.name)],
                                         outputs: vec![Self::output_seed(colls, &job.name)],
                                         logs: Vec::new(),
                                         inputs_dependency: Vec::new() };
                for (dep, res) in job.dependencies.iter().zip(resolved.into_iter().flatten()) {
                    map.inputs_dependency.push(ContentSeed { coll_id: colls.input_coll_id,
                                                             scope: colls.input_scope.clone(),
                                                             name: dep.input_name.clone(),
                                                             min_id: 0,
                                                             max_id: 0,
                                                             content_type: ContentType::File,
                                                             content_relation_type:
                                                                 ContentRelationType::InputDependency,
                                                             content_dep_id: Some(res.content_id),
                                                             substatus: res.substatus });
                }
                new_maps.insert(next_id, map);
                next_id += 1;
                self.data.dependency_map_deleted.push(job);
            } else {
                self.data.dependency_map.push(job);
            }
        }
        if self.data.dependency_map.is_empty() && self.data.dependency_map_deleted.is_empty() {
            self.data.has_new_inputs = false;
        }
        new_maps
    }

    // ------------------------------------------------------------------
    // sumisión
    // ------------------------------------------------------------------

    /// Payload de sumisión: plantilla del blueprint más los campos que
    /// dependen de los inputs registrados.
    pub fn build_task_param(&self, input_names: &[String]) -> Value {
        let mut param = if self.task_params.is_object() {
            self.task_params.clone()
        } else {
            Value::Object(serde_json::Map::new())
        };
        let obj = param.as_object_mut().expect("task_params object");
        obj.insert("taskName".into(), Value::from(self.unique_task_name()));
        obj.insert("nFiles".into(), Value::from(input_names.len()));
        obj.insert("pfnList".into(), Value::from(input_names.to_vec()));
        param
    }

    // ------------------------------------------------------------------
    // agregación de estado
    // ------------------------------------------------------------------

    /// Estado terminal del Transform derivado del estado de sus outputs, o
    /// `None` si todavía hay trabajo en vuelo.
    ///
    /// Sólo decide cuando los processings terminaron, no quedan inputs
    /// nuevos ni jobs retenidos, y todos los outputs fueron flusheados
    /// (status == substatus).
    pub fn syn_work_status(&self,
                           mapped: &BTreeMap<i64, RegisteredMap>,
                           processings_terminated: bool)
                           -> Option<TransformStatus> {
        if !processings_terminated || self.data.has_new_inputs || !self.data.dependency_map.is_empty() {
            return None;
        }
        let outputs: Vec<&ContentRecord> = mapped.values().flat_map(|m| m.outputs.iter()).collect();
        let unsettled = outputs.iter().any(|c| !c.substatus.is_terminal());
        if unsettled {
            return None;
        }
        let unflushed = outputs.iter().any(|c| c.status != c.substatus);
        if unflushed {
            return None;
        }
        let available = outputs.iter()
                               .filter(|c| c.substatus == ContentStatus::Available)
                               .count();
        Some(if available == outputs.len() {
                 TransformStatus::Finished
             } else if available > 0 {
                 TransformStatus::SubFinished
             } else {
                 TransformStatus::Failed
             })
    }
}
