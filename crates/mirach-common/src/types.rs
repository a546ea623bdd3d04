use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::Value;

/// Builds the topic every plugin result is published to.
///
/// # Examples
///
/// ```
/// use mirach_common::types::data_topic;
///
/// assert_eq!(data_topic("cust", "asset"), "mirach/data/cust/asset");
/// ```
pub fn data_topic(customer_id: &str, asset_id: &str) -> String {
    format!("mirach/data/{customer_id}/{asset_id}")
}

/// Default topic the agent listens on for remote commands.
pub fn command_topic(customer_id: &str, asset_id: &str) -> String {
    format!("mirach/cmd/{customer_id}/{asset_id}")
}

/// Data carried by a [`PluginResult`].
///
/// `Raw` keeps a JSON document exactly as a producer wrote it (external
/// commands); `Structured` holds an already decoded value. Both serialize to
/// the same JSON; deserializing always yields `Structured`.
#[derive(Debug, Clone)]
pub enum Payload {
    Raw(Box<RawValue>),
    Structured(Value),
}

impl Payload {
    /// Decodes a complete JSON document into a structured payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use mirach_common::types::Payload;
    ///
    /// let payload = Payload::from_json_str(r#"{"avg":1.2}"#).unwrap();
    /// assert_eq!(payload.to_value().unwrap()["avg"], 1.2);
    /// assert!(Payload::from_json_str("not json").is_err());
    /// ```
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s).map(Payload::Structured)
    }

    /// Returns the payload as a `serde_json::Value`, parsing raw text if needed.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Payload::Raw(raw) => serde_json::from_str(raw.get()),
            Payload::Structured(value) => Ok(value.clone()),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Raw(a), Payload::Raw(b)) => a.get() == b.get(),
            _ => match (self.to_value(), other.to_value()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Raw(raw) => raw.serialize(serializer),
            Payload::Structured(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Payload::Structured)
    }
}

/// The labeled output of one plugin execution.
///
/// # Examples
///
/// ```
/// use mirach_common::types::{Payload, PluginResult};
///
/// let res = PluginResult::new("load", Payload::from_json_str(r#"{"avg":1.2}"#).unwrap());
/// let json = serde_json::to_string(&res).unwrap();
/// assert_eq!(json, r#"{"type":"load","data":{"avg":1.2}}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Payload,
}

impl PluginResult {
    pub fn new(kind: impl Into<String>, data: Payload) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// One published wire unit. `kind` is the producer label; the body key
/// (`data`, `url` or `chunks`) tells a consumer how to read the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageBody {
    /// The whole result inline.
    Data(Payload),
    /// A reference to data stored elsewhere.
    Url(String),
    /// Ordered fragments of the serialized result.
    Chunks(Vec<String>),
}

impl MessageBody {
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Data(_) => "data",
            MessageBody::Url(_) => "url",
            MessageBody::Chunks(_) => "chunks",
        }
    }
}

/// Verb of an inbound control message.
///
/// # Examples
///
/// ```
/// use mirach_common::types::CommandKind;
///
/// let kind: CommandKind = "shutdown".parse().unwrap();
/// assert_eq!(kind, CommandKind::Stop);
/// assert_eq!(kind.to_string(), "stop");
/// assert!("reboot".parse::<CommandKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    #[serde(alias = "shutdown")]
    Stop,
    Run,
    Ping,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Stop => write!(f, "stop"),
            CommandKind::Run => write!(f, "run"),
            CommandKind::Ping => write!(f, "ping"),
        }
    }
}

impl std::str::FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stop" | "shutdown" => Ok(CommandKind::Stop),
            "run" => Ok(CommandKind::Run),
            "ping" => Ok(CommandKind::Ping),
            _ => Err(format!("unknown command: {s}")),
        }
    }
}

/// An inbound instruction, e.g. `{"type":"run","args":{"plugin":"load"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub args: Value,
}

impl Command {
    /// String argument lookup, `None` when absent or not a string.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}
