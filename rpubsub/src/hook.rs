use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Kind, PubSubError};
use crate::subscription::Subscription;
use crate::types::{DashMap, MessageRef, MsgId, SubKey, TopicName};
use crate::Result;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Type {
    OnSubscribed,
    OnUnsubscribed,
    BeforePublish,
    BeforeDelivery,
    OnOutgoingInvoke,
}

impl Type {
    pub const ALL: [Type; 5] =
        [Type::OnSubscribed, Type::OnUnsubscribed, Type::BeforePublish, Type::BeforeDelivery, Type::OnOutgoingInvoke];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Type::OnSubscribed => "on_subscribed",
            Type::OnUnsubscribed => "on_unsubscribed",
            Type::BeforePublish => "before_publish",
            Type::BeforeDelivery => "before_delivery",
            Type::OnOutgoingInvoke => "on_outgoing_invoke",
        }
    }
}

impl FromStr for Type {
    type Err = anyhow::Error;

    fn from_str(t: &str) -> Result<Type> {
        Ok(match t {
            "on_subscribed" => Type::OnSubscribed,
            "on_unsubscribed" => Type::OnUnsubscribed,
            "before_publish" => Type::BeforePublish,
            "before_delivery" => Type::BeforeDelivery,
            "on_outgoing_invoke" | "on_outgoing_soap_invoke" => Type::OnOutgoingInvoke,
            _ => return Err(anyhow!("{:?} is not defined", t)),
        })
    }
}

#[derive(Debug, Clone)]
pub enum Parameter {
    OnSubscribed(Subscription),
    OnUnsubscribed(Subscription),
    BeforePublish(TopicName, MessageRef),
    BeforeDelivery(Subscription, MessageRef),
    OnOutgoingInvoke(Subscription, Vec<MessageRef>),
}

impl Parameter {
    pub fn get_type(&self) -> Type {
        match self {
            Parameter::OnSubscribed(_) => Type::OnSubscribed,
            Parameter::OnUnsubscribed(_) => Type::OnUnsubscribed,
            Parameter::BeforePublish(_, _) => Type::BeforePublish,
            Parameter::BeforeDelivery(_, _) => Type::BeforeDelivery,
            Parameter::OnOutgoingInvoke(_, _) => Type::OnOutgoingInvoke,
        }
    }

    /// The context object handed to an external hook service.
    pub fn to_json(&self) -> serde_json::Value {
        let hook_type = self.get_type().as_str();
        match self {
            Parameter::OnSubscribed(sub) | Parameter::OnUnsubscribed(sub) => json!({
                "hook_type": hook_type,
                "topic_name": sub.topic_name,
                "sub": sub,
            }),
            Parameter::BeforePublish(topic_name, msg) => json!({
                "hook_type": hook_type,
                "topic_name": topic_name,
                "msg": msg.as_ref(),
            }),
            Parameter::BeforeDelivery(sub, msg) => json!({
                "hook_type": hook_type,
                "topic_name": sub.topic_name,
                "sub_key": sub.sub_key,
                "msg": msg.as_ref(),
            }),
            Parameter::OnOutgoingInvoke(sub, msgs) => json!({
                "hook_type": hook_type,
                "topic_name": sub.topic_name,
                "sub_key": sub.sub_key,
                "msgs": msgs.iter().map(|m| m.as_ref()).collect::<Vec<_>>(),
            }),
        }
    }
}

/// What a hook decided to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Deliver,
    Skip,
    Discard,
}

impl FromStr for HookAction {
    type Err = PubSubError;

    fn from_str(s: &str) -> std::result::Result<Self, PubSubError> {
        match s {
            "deliver" => Ok(HookAction::Deliver),
            "skip" => Ok(HookAction::Skip),
            "discard" | "delete" => Ok(HookAction::Discard),
            _ => Err(PubSubError::InvalidHookResult(s.to_owned())),
        }
    }
}

/// Raw reply of a hook, the action stays a string until it is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HookResult {
    #[serde(default)]
    pub hook_action: Option<String>,
}

impl HookResult {
    #[inline]
    pub fn action<A: Into<String>>(action: A) -> Self {
        Self { hook_action: Some(action.into()) }
    }

    /// An absent action means deliver.
    #[inline]
    pub fn hook_action(&self) -> std::result::Result<HookAction, PubSubError> {
        match self.hook_action.as_deref() {
            None | Some("") => Ok(HookAction::Deliver),
            Some(a) => a.parse(),
        }
    }
}

#[async_trait]
pub trait Handler: Sync + Send {
    /// Whether this implementation has anything to do at the given hook point.
    fn implements(&self, _typ: Type) -> bool {
        true
    }

    async fn hook(&self, param: &Parameter) -> Result<HookResult>;
}

/// Invokes a named service with a JSON context object, provided by the host.
#[async_trait]
pub trait ServiceInvoker: Sync + Send {
    async fn invoke(&self, service_name: &str, ctx: serde_json::Value) -> Result<serde_json::Value>;
}

/// A [`Handler`] backed by a service the host knows how to invoke by name.
pub struct ServiceHandler {
    service_name: String,
    invoker: Arc<dyn ServiceInvoker>,
    implements: Vec<Type>,
}

impl ServiceHandler {
    pub fn new<N: Into<String>>(service_name: N, invoker: Arc<dyn ServiceInvoker>, implements: Vec<Type>) -> Self {
        Self { service_name: service_name.into(), invoker, implements }
    }
}

#[async_trait]
impl Handler for ServiceHandler {
    fn implements(&self, typ: Type) -> bool {
        self.implements.contains(&typ)
    }

    async fn hook(&self, param: &Parameter) -> Result<HookResult> {
        let reply = self.invoker.invoke(&self.service_name, param.to_json()).await?;
        if reply.is_null() {
            return Ok(HookResult::default());
        }
        serde_json::from_value::<HookResult>(reply)
            .map_err(|e| anyhow!("hook service {} returned an unexpected reply, {:?}", self.service_name, e))
    }
}

/// Hook implementations of one topic, resolved whenever the topic is created or edited.
#[derive(Clone, Default)]
pub struct TopicHooks {
    service_id: Option<String>,
    on_subscribed: Option<Arc<dyn Handler>>,
    on_unsubscribed: Option<Arc<dyn Handler>>,
    before_publish: Option<Arc<dyn Handler>>,
    before_delivery: Option<Arc<dyn Handler>>,
    on_outgoing_invoke: Option<Arc<dyn Handler>>,
}

impl fmt::Debug for TopicHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = Type::ALL.iter().filter(|t| self.get(**t).is_some()).map(|t| t.as_str()).collect::<Vec<_>>();
        write!(f, "TopicHooks({:?}, {:?})", self.service_id, types)
    }
}

impl TopicHooks {
    fn new(service_id: String, handler: Arc<dyn Handler>) -> Self {
        let pick = |typ: Type| if handler.implements(typ) { Some(handler.clone()) } else { None };
        Self {
            on_subscribed: pick(Type::OnSubscribed),
            on_unsubscribed: pick(Type::OnUnsubscribed),
            before_publish: pick(Type::BeforePublish),
            before_delivery: pick(Type::BeforeDelivery),
            on_outgoing_invoke: pick(Type::OnOutgoingInvoke),
            service_id: Some(service_id),
        }
    }

    #[inline]
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    #[inline]
    pub fn get(&self, typ: Type) -> Option<&Arc<dyn Handler>> {
        match typ {
            Type::OnSubscribed => self.on_subscribed.as_ref(),
            Type::OnUnsubscribed => self.on_unsubscribed.as_ref(),
            Type::BeforePublish => self.before_publish.as_ref(),
            Type::BeforeDelivery => self.before_delivery.as_ref(),
            Type::OnOutgoingInvoke => self.on_outgoing_invoke.as_ref(),
        }
    }

    /// Runs a lifecycle hook in the background, failures are only logged.
    pub fn fire(&self, param: Parameter) {
        let typ = param.get_type();
        if let Some(handler) = self.get(typ).cloned() {
            tokio::spawn(async move {
                if let Err(e) = handler.hook(&param).await {
                    log::warn!("Hook {} failed, {:?}", typ.as_str(), e);
                }
            });
        }
    }

    /// Gate for a single message about to be published. An unknown action is an error.
    pub async fn before_publish(&self, topic_name: &TopicName, msg: &MessageRef) -> Result<HookAction> {
        let handler = match self.get(Type::BeforePublish) {
            Some(h) => h,
            None => return Ok(HookAction::Deliver),
        };
        let res = handler.hook(&Parameter::BeforePublish(topic_name.clone(), msg.clone())).await?;
        Ok(res.hook_action()?)
    }

    /// Sorts a batch into deliver, skip and discard lists. A hook failure or an
    /// unknown action skips only the message concerned and records a warning.
    pub async fn before_delivery(&self, sub: &Subscription, batch: Vec<MessageRef>) -> BeforeDelivery {
        let mut out = BeforeDelivery::default();
        let handler = match self.get(Type::BeforeDelivery) {
            Some(h) => h,
            None => {
                out.deliver = batch;
                return out;
            }
        };
        for msg in batch {
            let action = handler
                .hook(&Parameter::BeforeDelivery(sub.clone(), msg.clone()))
                .await
                .and_then(|res| Ok(res.hook_action()?));
            match action {
                Ok(HookAction::Deliver) => out.deliver.push(msg),
                Ok(HookAction::Skip) => out.skip.push(msg),
                Ok(HookAction::Discard) => out.discard.push(msg),
                Err(e) => {
                    let warning = format!(
                        "before_delivery hook failed for sub_key: {}, msg_id: {}, message skipped, {}",
                        sub.sub_key, msg.pub_msg_id, e
                    );
                    log::warn!("{}", warning);
                    out.warnings.push((msg.pub_msg_id.clone(), warning));
                    out.skip.push(msg);
                }
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct BeforeDelivery {
    pub deliver: Vec<MessageRef>,
    pub skip: Vec<MessageRef>,
    pub discard: Vec<MessageRef>,
    pub warnings: Vec<(MsgId, String)>,
}

/// Registry of hook implementations by service id.
#[derive(Clone, Default)]
pub struct DefaultHookManager {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl DefaultHookManager {
    #[inline]
    pub fn new() -> DefaultHookManager {
        Self::default()
    }

    #[inline]
    pub fn register<N: Into<String>>(&self, service_id: N, handler: Arc<dyn Handler>) {
        let service_id = service_id.into();
        if self.handlers.insert(service_id.clone(), handler).is_some() {
            log::info!("Hook service {} replaced", service_id);
        }
    }

    #[inline]
    pub fn unregister(&self, service_id: &str) -> bool {
        self.handlers.remove(service_id).is_some()
    }

    /// Turns a topic's optional hook service id into callable hooks.
    pub fn resolve(&self, service_id: Option<&str>) -> Result<TopicHooks> {
        match service_id {
            None => Ok(TopicHooks::default()),
            Some(id) => {
                let handler = self
                    .handlers
                    .get(id)
                    .map(|h| h.value().clone())
                    .ok_or_else(|| PubSubError::not_found(Kind::HookService, id))?;
                Ok(TopicHooks::new(id.to_owned(), handler))
            }
        }
    }
}
