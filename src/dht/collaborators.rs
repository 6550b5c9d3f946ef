use crate::dht::identifier::Tth;
use crate::dht::node::NodeSnapshot;
use std::sync::Arc;

/// Local connection facility receiving CTM/RCM requests
pub trait ConnectionHandler: Send + Sync {
    /// 对方请求我们连接到它
    fn connect_to_me(&self, _node: &NodeSnapshot, _protocol: &str, _port: u16, _token: &str) {}

    /// 对方请求我们发起反向连接
    fn reverse_connect(&self, _node: &NodeSnapshot, _protocol: &str, _token: &str) {}
}

/// Answers partial-file availability requests (PSR)
pub trait PartialFileSource: Send + Sync {
    /// Returns the reply parameters, `None` when nothing is shared
    fn partial_request(&self, _node: &NodeSnapshot, _params: &[String]) -> Option<Vec<String>> {
        None
    }
}

/// 私聊消息接收方
pub trait MessageSink: Send + Sync {
    fn private_message(&self, _node: &NodeSnapshot, _text: &str, _third_person: bool) {}
}

/// Generic key/value exchange behind GET/SND
pub trait ValueStore: Send + Sync {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn put(&self, _node: &NodeSnapshot, _key: &str, _value: &str) {}
}

/// 本地共享文件索引
pub trait ContentIndex: Send + Sync {
    /// Size of the local file with `tth`, if shared
    fn has_file(&self, _tth: &Tth) -> Option<u64> {
        None
    }
}

/// Collaborator that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollaborator;

impl ConnectionHandler for NoopCollaborator {}
impl PartialFileSource for NoopCollaborator {}
impl MessageSink for NoopCollaborator {}
impl ValueStore for NoopCollaborator {}
impl ContentIndex for NoopCollaborator {}

/// External services the engine forwards to
#[derive(Clone)]
pub struct Collaborators {
    pub connections: Arc<dyn ConnectionHandler>,
    pub partial_files: Arc<dyn PartialFileSource>,
    pub messages: Arc<dyn MessageSink>,
    pub values: Arc<dyn ValueStore>,
    pub content: Arc<dyn ContentIndex>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            connections: Arc::new(NoopCollaborator),
            partial_files: Arc::new(NoopCollaborator),
            messages: Arc::new(NoopCollaborator),
            values: Arc::new(NoopCollaborator),
            content: Arc::new(NoopCollaborator),
        }
    }
}
