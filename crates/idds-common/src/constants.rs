//! Constantes y enums de estado de las entidades.
//!
//! Cada enum lleva un valor entero estable (columna de DB) y un nombre serde
//! (metadata JSON). Los valores nunca se reutilizan ni se renumeran: son el
//! contrato observable entre versiones del esquema.

use serde::{Deserialize, Serialize};

/// Declara un enum con valor entero estable para columnas de base de datos.
///
/// Genera `value()` / `from_value()` además de las conversiones `From`/
/// `TryFrom`. La deserialización desde un valor desconocido es un error de
/// validación, nunca un pánico.
macro_rules! db_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $val:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        $vis enum $name {
            $($(#[$vmeta])* $variant = $val),+
        }

        impl $name {
            /// Valor entero persistido en la base de datos.
            pub fn value(self) -> i32 {
                self as i32
            }

            /// Variante desde el valor entero persistido, si existe.
            pub fn from_value(value: i32) -> Option<Self> {
                match value {
                    $($val => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$name> for i32 {
            fn from(v: $name) -> i32 {
                v.value()
            }
        }

        impl TryFrom<i32> for $name {
            type Error = crate::error::IddsError;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                Self::from_value(value).ok_or_else(|| {
                    crate::error::IddsError::Validation(format!("unknown {} value: {}",
                                                                stringify!($name),
                                                                value))
                })
            }
        }
    };
}

db_enum! {
    /// Ciclo de vida de un Request.
    pub enum RequestStatus {
        New = 1,
        Extend = 2,
        Transforming = 3,
        Finished = 4,
        SubFinished = 5,
        Failed = 6,
        ToCancel = 7,
        Cancelling = 8,
        Cancelled = 9,
        ToSuspend = 10,
        Suspending = 11,
        Suspended = 12,
        ToResume = 13,
        Resuming = 14,
        ToExpire = 15,
        Expired = 16,
        ToFinish = 17,
        ToForceFinish = 18,
    }
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self,
                 Self::Finished | Self::SubFinished | Self::Failed | Self::Cancelled | Self::Suspended | Self::Expired)
    }
}

db_enum! {
    /// Ciclo de vida de un Transform (y de su Work en el workflow).
    pub enum TransformStatus {
        New = 1,
        Extend = 2,
        Ready = 3,
        Transforming = 4,
        Finished = 5,
        SubFinished = 6,
        Failed = 7,
        ToCancel = 8,
        Cancelling = 9,
        Cancelled = 10,
        ToSuspend = 11,
        Suspending = 12,
        Suspended = 13,
        ToResume = 14,
        Resuming = 15,
        ToExpire = 16,
        Expired = 17,
        ToFinish = 18,
        ToForceFinish = 19,
    }
}

impl TransformStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self,
                 Self::Finished | Self::SubFinished | Self::Failed | Self::Cancelled | Self::Suspended | Self::Expired)
    }
}

db_enum! {
    /// Ciclo de vida de un Processing frente al workload manager externo.
    pub enum ProcessingStatus {
        New = 1,
        Submitting = 2,
        Submitted = 3,
        Running = 4,
        Finished = 5,
        SubFinished = 6,
        Failed = 7,
        ToCancel = 8,
        Cancelling = 9,
        Cancelled = 10,
        ToSuspend = 11,
        Suspending = 12,
        Suspended = 13,
        ToResume = 14,
        Resuming = 15,
        ToExpire = 16,
        Expired = 17,
        ToFinish = 18,
        ToForceFinish = 19,
        TimeOut = 20,
    }
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self,
                 Self::Finished
                 | Self::SubFinished
                 | Self::Failed
                 | Self::Cancelled
                 | Self::Suspended
                 | Self::Expired
                 | Self::TimeOut)
    }
}

db_enum! {
    pub enum CollectionStatus {
        New = 1,
        Open = 2,
        Processing = 3,
        Closed = 4,
        Failed = 5,
        Deleted = 6,
    }
}

db_enum! {
    pub enum CollectionType {
        Dataset = 1,
        Container = 2,
        File = 3,
        PseudoDataset = 4,
    }
}

db_enum! {
    pub enum CollectionRelationType {
        Input = 1,
        Output = 2,
        Log = 3,
    }
}

db_enum! {
    /// Estado fino por archivo (o rango de archivo).
    pub enum ContentStatus {
        New = 1,
        Processing = 2,
        Available = 3,
        Failed = 4,
        FinalFailed = 5,
        Lost = 6,
        Missing = 7,
        Mapped = 8,
    }
}

impl ContentStatus {
    /// Estados que se propagan a los contents dependientes (resolver §4.H).
    pub fn propagates(self) -> bool {
        matches!(self,
                 Self::Available | Self::Missing | Self::Failed | Self::FinalFailed | Self::Lost)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self,
                 Self::Available | Self::Failed | Self::FinalFailed | Self::Lost | Self::Missing)
    }
}

db_enum! {
    pub enum ContentType {
        File = 1,
        Event = 2,
        PseudoContent = 3,
    }
}

db_enum! {
    pub enum ContentRelationType {
        Input = 1,
        Output = 2,
        Log = 3,
        InputDependency = 4,
    }
}

db_enum! {
    /// Tipo de Transform/Work.
    pub enum TransformType {
        Workflow = 1,
        EventStreaming = 2,
        StageIn = 3,
        ActiveLearning = 4,
        HyperParameterOpt = 5,
        Processing = 6,
        Actuating = 7,
        Data = 8,
        Other = 9,
    }
}

db_enum! {
    pub enum MessageType {
        StatusReport = 1,
        CollectionLifecycle = 2,
        ContentLifecycle = 3,
        HealthHeartbeat = 4,
        IddsCommunication = 5,
    }
}

db_enum! {
    pub enum MessageStatus {
        New = 1,
        Delivered = 2,
        Archived = 3,
        Failed = 4,
    }
}

db_enum! {
    pub enum MessageSource {
        Clerk = 1,
        Transformer = 2,
        Carrier = 3,
        Conductor = 4,
        Rest = 5,
        Outside = 6,
    }
}

db_enum! {
    pub enum MessageDestination {
        Clerk = 1,
        Transformer = 2,
        Carrier = 3,
        Conductor = 4,
        Outside = 5,
    }
}

db_enum! {
    /// Operaciones de control entrantes (tabla commands).
    pub enum CommandType {
        ToCancel = 1,
        ToSuspend = 2,
        ToResume = 3,
        ToExpire = 4,
        ToFinish = 5,
        ToForceFinish = 6,
    }
}

impl CommandType {
    /// Substatus de request que el Clerk escribe al consumir el comando.
    pub fn request_substatus(self) -> RequestStatus {
        match self {
            Self::ToCancel => RequestStatus::ToCancel,
            Self::ToSuspend => RequestStatus::ToSuspend,
            Self::ToResume => RequestStatus::ToResume,
            Self::ToExpire => RequestStatus::ToExpire,
            Self::ToFinish => RequestStatus::ToFinish,
            Self::ToForceFinish => RequestStatus::ToForceFinish,
        }
    }
}

db_enum! {
    pub enum CommandStatus {
        New = 1,
        Processing = 2,
        Processed = 3,
        Failed = 4,
    }
}

db_enum! {
    pub enum CommandLocation {
        Rest = 1,
        Clerk = 2,
        Transformer = 3,
        Carrier = 4,
        Other = 5,
    }
}

db_enum! {
    /// Marca de fila reclamada por un worker. Exactamente un worker puede
    /// sostener `Locking` sobre una fila a la vez.
    pub enum Locking {
        Idle = 0,
        Locking = 1,
    }
}

/// Resultado convencional de un handler de evento.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    /// La fila está reclamada por otro worker; el evento se reencola.
    Locked,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_values_roundtrip() {
        for status in [RequestStatus::New, RequestStatus::Transforming, RequestStatus::Expired] {
            assert_eq!(RequestStatus::from_value(status.value()), Some(status));
        }
        assert_eq!(ContentStatus::from_value(99), None);
        assert!(TransformStatus::try_from(7).is_ok());
        assert!(TransformStatus::try_from(999).is_err());
    }

    #[test]
    fn terminal_sets() {
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::Cancelling.is_terminal());
        assert!(ProcessingStatus::SubFinished.is_terminal());
        assert!(!ProcessingStatus::Resuming.is_terminal());
        assert!(ContentStatus::Missing.propagates());
        assert!(!ContentStatus::Mapped.propagates());
    }
}
