//! Typed view of the positional `target` + `args` convention.
//!
//! On the wire a call is `{"target": "controller", "args": ["KeyringController", "unlock", "pw"]}`.
//! Each handler group reads its leading arguments as addressing information;
//! [`Request::parse`] validates that shape once, before dispatch, so handlers
//! work with named fields instead of indexing into a JSON array.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::BusError;

/// The fixed routing vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum HandlerGroup {
    Controller,
    Engine,
    Sqlite,
    AgentProvider,
    TransactionResult,
    RegisterCls,
    /// Reverse calls, answered by the UI context.
    CallRegister,
}

/// One function group the UI context exposes to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default, alias = "funcs")]
    pub methods: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, methods: Vec<String>) -> Self {
        Self { name: name.into(), methods }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Controller {
        component: String,
        method: String,
        args: Vec<Value>,
    },
    Engine {
        method: String,
        args: Vec<Value>,
    },
    Sqlite {
        method: String,
        args: Vec<Value>,
    },
    AgentProvider {
        controller: String,
        /// Sub-provider key; only multi-provider controllers use it.
        provider: Option<String>,
        method: String,
        args: Vec<Value>,
    },
    TransactionResult {
        key: String,
    },
    RegisterCls {
        descriptors: Vec<AgentDescriptor>,
    },
    CallRegister {
        agent: String,
        method: String,
        args: Vec<Value>,
    },
}

struct Positional {
    group: HandlerGroup,
    items: std::vec::IntoIter<Value>,
}

impl Positional {
    fn invalid(&self, reason: impl Into<String>) -> BusError {
        BusError::InvalidArgs {
            group: self.group.to_string(),
            reason: reason.into(),
        }
    }

    fn string(&mut self, what: &str) -> Result<String, BusError> {
        match self.items.next() {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(self.invalid(format!("{what} must be a string, got {other}"))),
            None => Err(self.invalid(format!("missing {what}"))),
        }
    }

    fn optional_string(&mut self, what: &str) -> Result<Option<String>, BusError> {
        match self.items.next() {
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(self.invalid(format!("{what} must be a string or null, got {other}"))),
        }
    }

    /// Ids travel as strings but numeric ids are accepted too.
    fn key(&mut self, what: &str) -> Result<String, BusError> {
        match self.items.next() {
            Some(Value::String(s)) => Ok(s),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(self.invalid(format!("{what} must be a string, got {other}"))),
            None => Err(self.invalid(format!("missing {what}"))),
        }
    }

    fn rest(self) -> Vec<Value> {
        self.items.collect()
    }
}

impl Request {
    pub fn parse(target: &str, args: Vec<Value>) -> Result<Self, BusError> {
        let group: HandlerGroup = target
            .parse()
            .map_err(|_| BusError::UnknownRoute(target.to_owned()))?;
        let mut args = Positional {
            group,
            items: args.into_iter(),
        };

        let request = match group {
            HandlerGroup::Controller => Request::Controller {
                component: args.string("component")?,
                method: args.string("method")?,
                args: args.rest(),
            },
            HandlerGroup::Engine => Request::Engine {
                method: args.string("method")?,
                args: args.rest(),
            },
            HandlerGroup::Sqlite => Request::Sqlite {
                method: args.string("method")?,
                args: args.rest(),
            },
            HandlerGroup::AgentProvider => Request::AgentProvider {
                controller: args.string("controller")?,
                provider: args.optional_string("provider type")?,
                method: args.string("method")?,
                args: args.rest(),
            },
            HandlerGroup::TransactionResult => Request::TransactionResult {
                key: args.key("transaction id")?,
            },
            HandlerGroup::RegisterCls => {
                let descriptors = match args.items.next() {
                    None | Some(Value::Null) => Vec::new(),
                    Some(list) => serde_json::from_value(list)
                        .map_err(|e| args.invalid(format!("bad descriptor list: {e}")))?,
                };
                Request::RegisterCls { descriptors }
            }
            HandlerGroup::CallRegister => Request::CallRegister {
                agent: args.string("agent")?,
                method: args.string("method")?,
                args: args.rest(),
            },
        };
        Ok(request)
    }

    pub fn group(&self) -> HandlerGroup {
        match self {
            Request::Controller { .. } => HandlerGroup::Controller,
            Request::Engine { .. } => HandlerGroup::Engine,
            Request::Sqlite { .. } => HandlerGroup::Sqlite,
            Request::AgentProvider { .. } => HandlerGroup::AgentProvider,
            Request::TransactionResult { .. } => HandlerGroup::TransactionResult,
            Request::RegisterCls { .. } => HandlerGroup::RegisterCls,
            Request::CallRegister { .. } => HandlerGroup::CallRegister,
        }
    }

    /// Flatten back into the positional wire form.
    pub fn into_parts(self) -> (HandlerGroup, Vec<Value>) {
        fn lead(head: Vec<Value>, rest: Vec<Value>) -> Vec<Value> {
            head.into_iter().chain(rest).collect()
        }

        let group = self.group();
        let args = match self {
            Request::Controller { component, method, args } => {
                lead(vec![json!(component), json!(method)], args)
            }
            Request::Engine { method, args } | Request::Sqlite { method, args } => {
                lead(vec![json!(method)], args)
            }
            Request::AgentProvider { controller, provider, method, args } => lead(
                vec![json!(controller), provider.map_or(Value::Null, Value::String), json!(method)],
                args,
            ),
            Request::TransactionResult { key } => vec![json!(key)],
            Request::RegisterCls { descriptors } => vec![Value::Array(
                descriptors
                    .into_iter()
                    .map(|d| json!({ "name": d.name, "methods": d.methods }))
                    .collect(),
            )],
            Request::CallRegister { agent, method, args } => {
                lead(vec![json!(agent), json!(method)], args)
            }
        };
        (group, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_call_is_split_into_address_and_args() {
        let req = Request::parse(
            "controller",
            vec![json!("PreferencesController"), json!("setSelectedAddress"), json!("0x1")],
        )
        .unwrap();
        assert_eq!(
            req,
            Request::Controller {
                component: "PreferencesController".into(),
                method: "setSelectedAddress".into(),
                args: vec![json!("0x1")],
            }
        );
    }

    #[test]
    fn unknown_group_is_a_routing_failure() {
        let err = Request::parse("wallet", vec![]).unwrap_err();
        assert_eq!(err, BusError::UnknownRoute("wallet".into()));
    }

    #[test]
    fn missing_method_is_reported_per_group() {
        let err = Request::parse("controller", vec![json!("KeyringController")]).unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments for controller: missing method");
    }

    #[test]
    fn agent_provider_accepts_null_provider_type() {
        let req = Request::parse(
            "agent_provider",
            vec![json!("BscNetworkController"), json!(null), json!("sendAsync"), json!({"id": 1})],
        )
        .unwrap();
        assert_eq!(
            req,
            Request::AgentProvider {
                controller: "BscNetworkController".into(),
                provider: None,
                method: "sendAsync".into(),
                args: vec![json!({"id": 1})],
            }
        );
    }

    #[test]
    fn transaction_result_accepts_numeric_id() {
        let req = Request::parse("transaction_result", vec![json!(1234)]).unwrap();
        assert_eq!(req, Request::TransactionResult { key: "1234".into() });
    }

    #[test]
    fn register_cls_reads_funcs_alias() {
        let req = Request::parse(
            "register_cls",
            vec![json!([{"name": "TsUtils", "funcs": ["logDebug"]}, {"name": "ApiClient", "methods": []}])],
        )
        .unwrap();
        assert_eq!(
            req,
            Request::RegisterCls {
                descriptors: vec![
                    AgentDescriptor::new("TsUtils", vec!["logDebug".into()]),
                    AgentDescriptor::new("ApiClient", vec![]),
                ],
            }
        );
        assert_eq!(
            Request::parse("register_cls", vec![]).unwrap(),
            Request::RegisterCls { descriptors: vec![] }
        );
    }

    #[test]
    fn into_parts_restores_positional_form() {
        let args = vec![json!("RpcNetworkController"), json!("mainnet"), json!("sendAsync"), json!(7)];
        let req = Request::parse("agent_provider", args.clone()).unwrap();
        assert_eq!(req.into_parts(), (HandlerGroup::AgentProvider, args));
    }

    #[test]
    fn group_names_match_wire_vocabulary() {
        assert_eq!(HandlerGroup::AgentProvider.as_ref(), "agent_provider");
        assert_eq!(HandlerGroup::CallRegister.as_ref(), "call_register");
        assert_eq!("register_cls".parse::<HandlerGroup>().unwrap(), HandlerGroup::RegisterCls);
    }
}
