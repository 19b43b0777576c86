use log::kv::{ToValue, Value};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ToValue for $name {
            fn to_value(&self) -> Value {
                Value::from_display(self)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl ToValue for $name {
            fn to_value(&self) -> Value {
                Value::from_display(self)
            }
        }
    };
}

uuid_id!(
    /// ID of a task in the processing queue.
    TaskId
);
uuid_id!(
    /// ID of a batch run started by the batch orchestrator.
    BatchId
);
uuid_id!(ClosingId);
uuid_id!(ChecklistItemId);
uuid_id!(NotificationId);
uuid_id!(PaymentId);

string_id!(
    /// ID of a client (tenant customer) whose books are being closed.
    ClientId
);
string_id!(
    /// Identity of a worker claiming tasks from the queue.
    ///
    /// Workers are ephemeral, so the ID is the registering function's name plus a random suffix,
    /// e.g. `batch-closing-3f2a9c1d`.
    WorkerId
);

impl WorkerId {
    pub fn generate(function_name: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{function_name}-{}", &suffix[..8]))
    }
}
