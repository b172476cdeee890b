//! Collaborator seams: the wire transport and the contract executor are
//! consumed behind traits so the consensus core never depends on their
//! implementations.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::errors::{ChainError, ChainResult};
use crate::types::{ByteCodeObject, Variant};

/// Message kinds exchanged between nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    RoundTable,
    Stage1,
    Stage2,
    Stage3,
    Stage1Request,
    Stage2Request,
    Stage3Request,
    Hash,
    HashReply,
    TransactionsPacket,
    PacketHashesRequest,
    PacketHashesReply,
    BlockRequest,
    BlockReply,
    RoundTableRequest,
    RoundTableReply,
    EmptyRoundPack,
    SmartReject,
    SmartStage1,
    SmartStage2,
    SmartStage3,
    SmartStage1Request,
    SmartStage2Request,
    SmartStage3Request,
}

#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub msg_type: MsgType,
    pub round: u64,
    pub sender: [u8; PUBLIC_KEY_SIZE],
    pub payload: Vec<u8>,
}

/// Best-effort message delivery. Implementations must not block on peers.
pub trait Transport: Send + Sync {
    fn broadcast(&self, msg_type: MsgType, round: u64, payload: &[u8]);
    fn unicast(&self, target: &[u8; PUBLIC_KEY_SIZE], msg_type: MsgType, round: u64, payload: &[u8]);
}

/// In-process transport wiring every registered peer to a channel. Backs the
/// consensus tests and single-host deployments.
#[derive(Default)]
pub struct ChannelTransport {
    peers: Mutex<HashMap<[u8; PUBLIC_KEY_SIZE], UnboundedSender<IncomingMessage>>>,
    self_key: [u8; PUBLIC_KEY_SIZE],
}

impl ChannelTransport {
    pub fn new(self_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            self_key,
        }
    }

    pub fn register(&self, key: [u8; PUBLIC_KEY_SIZE], sender: UnboundedSender<IncomingMessage>) {
        self.peers.lock().insert(key, sender);
    }
}

impl Transport for ChannelTransport {
    fn broadcast(&self, msg_type: MsgType, round: u64, payload: &[u8]) {
        let peers = self.peers.lock();
        for (key, sender) in peers.iter() {
            if *key == self.self_key {
                continue;
            }
            let _ = sender.send(IncomingMessage {
                msg_type,
                round,
                sender: self.self_key,
                payload: payload.to_vec(),
            });
        }
    }

    fn unicast(
        &self,
        target: &[u8; PUBLIC_KEY_SIZE],
        msg_type: MsgType,
        round: u64,
        payload: &[u8],
    ) {
        if let Some(sender) = self.peers.lock().get(target) {
            let _ = sender.send(IncomingMessage {
                msg_type,
                round,
                sender: self.self_key,
                payload: payload.to_vec(),
            });
        }
    }
}

/// `(code, message)` pair returned by every executor call; code zero means
/// success and anything else is passed to the client verbatim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub code: u8,
    pub message: String,
}

impl ExecutorStatus {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MethodHeader {
    pub method: String,
    pub params: Vec<Variant>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub status: ExecutorStatus,
    pub new_state: Vec<u8>,
    pub results: Vec<Variant>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContractMethod {
    pub name: String,
    pub return_type: String,
    pub arguments: Vec<MethodArgument>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MethodArgument {
    pub name: String,
    pub type_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContractMethodsResult {
    pub status: ExecutorStatus,
    pub methods: Vec<ContractMethod>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContractVariablesResult {
    pub status: ExecutorStatus,
    pub variables: BTreeMap<String, Variant>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompileResult {
    pub status: ExecutorStatus,
    pub bytecode_objects: Vec<ByteCodeObject>,
}

/// Opaque sandbox that runs contract bytecode. The core holds no lock while
/// calling into it.
pub trait Executor: Send + Sync {
    fn execute_bytecode(
        &self,
        caller: &[u8; PUBLIC_KEY_SIZE],
        contract: &[u8; PUBLIC_KEY_SIZE],
        bytecode: &[ByteCodeObject],
        state: &[u8],
        methods: &[MethodHeader],
        timeout_ms: u64,
    ) -> ChainResult<ExecuteResult>;

    fn get_contract_methods(&self, bytecode: &[ByteCodeObject])
        -> ChainResult<ContractMethodsResult>;

    fn get_contract_variables(
        &self,
        bytecode: &[ByteCodeObject],
        state: &[u8],
    ) -> ChainResult<ContractVariablesResult>;

    fn compile_source_code(&self, source: &str) -> ChainResult<CompileResult>;
}

/// Executor that rejects every call; used when a node runs without a sandbox
/// attached.
#[derive(Default)]
pub struct NoopExecutor;

impl Executor for NoopExecutor {
    fn execute_bytecode(
        &self,
        _caller: &[u8; PUBLIC_KEY_SIZE],
        _contract: &[u8; PUBLIC_KEY_SIZE],
        _bytecode: &[ByteCodeObject],
        _state: &[u8],
        _methods: &[MethodHeader],
        _timeout_ms: u64,
    ) -> ChainResult<ExecuteResult> {
        Err(ChainError::Config("no executor attached".into()))
    }

    fn get_contract_methods(
        &self,
        _bytecode: &[ByteCodeObject],
    ) -> ChainResult<ContractMethodsResult> {
        Err(ChainError::Config("no executor attached".into()))
    }

    fn get_contract_variables(
        &self,
        _bytecode: &[ByteCodeObject],
        _state: &[u8],
    ) -> ChainResult<ContractVariablesResult> {
        Err(ChainError::Config("no executor attached".into()))
    }

    fn compile_source_code(&self, _source: &str) -> ChainResult<CompileResult> {
        Err(ChainError::Config("no executor attached".into()))
    }
}

/// Scriptable executor for tests: canned method tables and an execution
/// closure keyed by method name.
#[derive(Default)]
pub struct MockExecutor {
    pub methods: Mutex<Vec<ContractMethod>>,
    pub variables: Mutex<BTreeMap<String, Variant>>,
    pub execute_results: Mutex<HashMap<String, ExecuteResult>>,
}

impl MockExecutor {
    pub fn with_methods(names: &[&str]) -> Self {
        let executor = Self::default();
        *executor.methods.lock() = names
            .iter()
            .map(|name| ContractMethod {
                name: (*name).to_string(),
                return_type: "void".into(),
                arguments: Vec::new(),
            })
            .collect();
        executor
    }

    pub fn script_execution(&self, method: &str, result: ExecuteResult) {
        self.execute_results.lock().insert(method.to_string(), result);
    }
}

impl Executor for MockExecutor {
    fn execute_bytecode(
        &self,
        _caller: &[u8; PUBLIC_KEY_SIZE],
        _contract: &[u8; PUBLIC_KEY_SIZE],
        _bytecode: &[ByteCodeObject],
        _state: &[u8],
        methods: &[MethodHeader],
        _timeout_ms: u64,
    ) -> ChainResult<ExecuteResult> {
        let method = methods.first().map(|m| m.method.as_str()).unwrap_or("");
        Ok(self
            .execute_results
            .lock()
            .get(method)
            .cloned()
            .unwrap_or_default())
    }

    fn get_contract_methods(
        &self,
        _bytecode: &[ByteCodeObject],
    ) -> ChainResult<ContractMethodsResult> {
        Ok(ContractMethodsResult {
            status: ExecutorStatus::ok(),
            methods: self.methods.lock().clone(),
        })
    }

    fn get_contract_variables(
        &self,
        _bytecode: &[ByteCodeObject],
        _state: &[u8],
    ) -> ChainResult<ContractVariablesResult> {
        Ok(ContractVariablesResult {
            status: ExecutorStatus::ok(),
            variables: self.variables.lock().clone(),
        })
    }

    fn compile_source_code(&self, source: &str) -> ChainResult<CompileResult> {
        Ok(CompileResult {
            status: ExecutorStatus::ok(),
            bytecode_objects: vec![ByteCodeObject {
                name: "Main".into(),
                bytecode: source.as_bytes().to_vec(),
            }],
        })
    }
}
