//! Query surface of the node. Every response carries a `(code, message)`
//! status: 0 Success, 1 Failure, 2 NotImplemented, 3 NotFound,
//! 4 InProgress. Listing endpoints share the pagination contract
//! `offset >= 0`, `0 < limit <= 100`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task;
use tracing::info;

use crate::crypto::{public_key_bytes_from_hex, PUBLIC_KEY_SIZE};
use crate::errors::{ChainError, ChainResult};
use crate::node::{FlowResponse, NodeHandle, TransactionState};
use crate::tokens::is_zero_amount;
use crate::tracker::OperationState;
use crate::types::{
    trx_fields, Address, Amount, Commission, PoolHash, SmartContractInvocation, Transaction,
    TransactionId, UserField, Variant,
};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Clone, Serialize)]
pub struct ApiStatus {
    pub code: u8,
    pub message: String,
}

impl ApiStatus {
    fn success() -> Self {
        Self {
            code: 0,
            message: "Success".into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            code: 3,
            message: "Not found".into(),
        }
    }

    fn in_progress() -> Self {
        Self {
            code: 4,
            message: "Transaction in progress".into(),
        }
    }

    fn from_error(err: &ChainError) -> Self {
        match err {
            ChainError::NotFound(message) => Self {
                code: 3,
                message: message.clone(),
            },
            err => Self::failure(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct AmountDto {
    integral: i32,
    fraction: u64,
}

impl From<Amount> for AmountDto {
    fn from(amount: Amount) -> Self {
        Self {
            integral: amount.integral(),
            fraction: amount.fraction(),
        }
    }
}

fn parse_address(raw: &str) -> ChainResult<Address> {
    if let Ok(id) = raw.parse::<u32>() {
        return Ok(Address::WalletId(id));
    }
    Ok(Address::PublicKey(public_key_bytes_from_hex(raw)?))
}

fn parse_key(raw: &str) -> ChainResult<[u8; PUBLIC_KEY_SIZE]> {
    public_key_bytes_from_hex(raw)
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/wallets/:address/data", get(wallet_data))
        .route("/wallets/:address/balance", get(wallet_balance))
        .route("/wallets/:address/id", get(wallet_id))
        .route("/wallets/:address/transactions-count", get(wallet_transactions_count))
        .route("/wallets/:address/transactions", get(wallet_transactions))
        .route("/wallets/:address/tokens", get(wallet_token_balances))
        .route("/transactions/flow", post(transaction_flow))
        .route("/transactions/state", post(transactions_state))
        .route("/transactions/:pool_hash/:index", get(transaction_get))
        .route("/pools", get(pool_list))
        .route("/pools/:hash", get(pool_info))
        .route("/pools/:hash/transactions", get(pool_transactions))
        .route("/contracts/all", get(contracts_all))
        .route("/contracts/by-deployer/:address", get(contracts_by_deployer))
        .route("/contracts/addresses/:address", get(contract_addresses))
        .route("/contracts/compile", post(contract_compile))
        .route("/contracts/execute-count", get(execute_count))
        .route("/contracts/:address", get(contract_get))
        .route("/contracts/:address/data", get(contract_data))
        .route("/contracts/:address/method-params", get(contract_method_params))
        .route("/contracts/:address/wait", get(wait_for_smart_transaction))
        .route("/tokens", get(token_list))
        .route("/tokens/:address", get(token_info))
        .route("/tokens/:address/holders", get(token_holders))
        .route("/tokens/:address/transfers", get(token_transfers))
        .route("/tokens/:address/transactions", get(token_transactions))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "query API listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    public_key: String,
    round: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        public_key: hex::encode(state.node.public_key()),
        round: state.node.current_round(),
    })
}

// --- wallets ---------------------------------------------------------------

#[derive(Serialize)]
struct WalletDataResponse {
    status: ApiStatus,
    wallet_id: Option<u32>,
    balance: Option<AmountDto>,
    last_transaction_inner_id: Option<u64>,
}

async fn wallet_data(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<WalletDataResponse> {
    let record = parse_address(&address)
        .ok()
        .and_then(|address| state.node.wallets().data(&address));
    match record {
        Some(record) => Json(WalletDataResponse {
            status: ApiStatus::success(),
            wallet_id: record.wallet_id,
            balance: Some(record.balance.into()),
            last_transaction_inner_id: Some(record.last_inner_id),
        }),
        None => Json(WalletDataResponse {
            status: ApiStatus::not_found(),
            wallet_id: None,
            balance: None,
            last_transaction_inner_id: None,
        }),
    }
}

#[derive(Serialize)]
struct WalletBalanceResponse {
    status: ApiStatus,
    balance: Option<AmountDto>,
}

async fn wallet_balance(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<WalletBalanceResponse> {
    let balance = parse_address(&address)
        .ok()
        .and_then(|address| state.node.wallets().balance(&address));
    match balance {
        Some(balance) => Json(WalletBalanceResponse {
            status: ApiStatus::success(),
            balance: Some(balance.into()),
        }),
        None => Json(WalletBalanceResponse {
            status: ApiStatus::not_found(),
            balance: None,
        }),
    }
}

#[derive(Serialize)]
struct WalletIdResponse {
    status: ApiStatus,
    wallet_id: Option<u32>,
}

async fn wallet_id(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<WalletIdResponse> {
    let wallet_id = parse_key(&address)
        .ok()
        .and_then(|key| state.node.wallets().wallet_id_of(&key));
    match wallet_id {
        Some(wallet_id) => Json(WalletIdResponse {
            status: ApiStatus::success(),
            wallet_id: Some(wallet_id),
        }),
        None => Json(WalletIdResponse {
            status: ApiStatus::not_found(),
            wallet_id: None,
        }),
    }
}

#[derive(Serialize)]
struct WalletTransactionsCountResponse {
    status: ApiStatus,
    count: Option<u64>,
    last_transaction_inner_id: Option<u64>,
}

async fn wallet_transactions_count(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<WalletTransactionsCountResponse> {
    let record = parse_address(&address)
        .ok()
        .and_then(|address| state.node.wallets().data(&address));
    match record {
        Some(record) => Json(WalletTransactionsCountResponse {
            status: ApiStatus::success(),
            count: Some(record.transactions_count),
            last_transaction_inner_id: Some(record.last_inner_id),
        }),
        None => Json(WalletTransactionsCountResponse {
            status: ApiStatus::not_found(),
            count: None,
            last_transaction_inner_id: None,
        }),
    }
}

// --- transactions ----------------------------------------------------------

#[derive(Serialize)]
struct SealedTransactionDto {
    id: TransactionIdDto,
    inner_id: u64,
    source: String,
    target: String,
    amount: AmountDto,
    max_fee: f64,
    counted_fee: f64,
    currency: u8,
    transaction_type: &'static str,
    method: Option<String>,
    state: Option<&'static str>,
    user_data: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct TransactionIdDto {
    pool_hash: String,
    index: u32,
}

impl From<&TransactionId> for TransactionIdDto {
    fn from(id: &TransactionId) -> Self {
        Self {
            pool_hash: id.pool_hash.to_hex(),
            index: id.index,
        }
    }
}

fn operation_state_name(state: OperationState) -> &'static str {
    match state {
        OperationState::Pending => "Pending",
        OperationState::Success => "Success",
        OperationState::Failed => "Failed",
    }
}

fn convert_transaction(
    state: &AppState,
    id: &TransactionId,
    transaction: &Transaction,
) -> SealedTransactionDto {
    let resolve = |address: &Address| {
        state
            .node
            .wallets()
            .resolve(address)
            .map(hex::encode)
            .unwrap_or_else(|| address.to_string())
    };
    let transaction_type = if transaction.is_smart_state() {
        "SmartState"
    } else if transaction.is_deploy() {
        "SmartDeploy"
    } else if transaction.is_smart() {
        "SmartExecute"
    } else {
        "Normal"
    };
    let method = transaction
        .invocation()
        .map(|invocation| invocation.method)
        .filter(|method| !method.is_empty());
    let operation_state = if transaction.is_smart() {
        state
            .node
            .tracker()
            .operation(id)
            .map(|operation| operation_state_name(operation.state))
    } else {
        None
    };
    SealedTransactionDto {
        id: id.into(),
        inner_id: transaction.inner_id(),
        source: resolve(&transaction.source),
        target: resolve(&transaction.target),
        amount: transaction.amount.into(),
        max_fee: transaction.max_fee.to_f64(),
        counted_fee: transaction.counted_fee.to_f64(),
        currency: transaction.currency,
        transaction_type,
        method,
        state: operation_state,
        user_data: transaction
            .user_field(trx_fields::GENERAL_DATA)
            .and_then(UserField::as_bytes)
            .map(<[u8]>::to_vec),
    }
}

#[derive(Serialize)]
struct TransactionGetResponse {
    status: ApiStatus,
    found: bool,
    transaction: Option<SealedTransactionDto>,
}

async fn transaction_get(
    State(state): State<AppState>,
    Path((pool_hash, index)): Path<(String, u32)>,
) -> Json<TransactionGetResponse> {
    let result = PoolHash::from_hex(&pool_hash)
        .map(|hash| TransactionId::new(hash, index))
        .and_then(|id| {
            Ok(state
                .node
                .store()
                .load_transaction(&id)?
                .map(|transaction| convert_transaction(&state, &id, &transaction)))
        });
    match result {
        Ok(Some(transaction)) => Json(TransactionGetResponse {
            status: ApiStatus::success(),
            found: true,
            transaction: Some(transaction),
        }),
        Ok(None) => Json(TransactionGetResponse {
            status: ApiStatus::not_found(),
            found: false,
            transaction: None,
        }),
        Err(err) => Json(TransactionGetResponse {
            status: ApiStatus::from_error(&err),
            found: false,
            transaction: None,
        }),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Serialize)]
struct TransactionsResponse {
    status: ApiStatus,
    transactions: Vec<SealedTransactionDto>,
}

async fn wallet_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Json<TransactionsResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(TransactionsResponse {
            status: ApiStatus::failure("invalid pagination"),
            transactions: Vec::new(),
        });
    }
    let result = parse_address(&address).and_then(|address| {
        state
            .node
            .store()
            .transactions_of(&address, page.offset as usize, page.limit as usize)
    });
    match result {
        Ok(found) => Json(TransactionsResponse {
            status: ApiStatus::success(),
            transactions: found
                .iter()
                .map(|(id, transaction)| convert_transaction(&state, id, transaction))
                .collect(),
        }),
        Err(err) => Json(TransactionsResponse {
            status: ApiStatus::from_error(&err),
            transactions: Vec::new(),
        }),
    }
}

#[derive(Deserialize)]
struct TransactionsStateRequest {
    address: String,
    inner_ids: Vec<u64>,
}

#[derive(Serialize)]
struct TransactionsStateResponse {
    status: ApiStatus,
    states: Vec<(u64, &'static str)>,
    round: u64,
}

async fn transactions_state(
    State(state): State<AppState>,
    Json(request): Json<TransactionsStateRequest>,
) -> Json<TransactionsStateResponse> {
    let round = state.node.current_round();
    let result = parse_address(&request.address)
        .and_then(|address| state.node.transactions_state(&address, &request.inner_ids));
    match result {
        Ok(states) => Json(TransactionsStateResponse {
            status: ApiStatus::success(),
            states: states
                .into_iter()
                .map(|(inner_id, transaction_state)| {
                    let name = match transaction_state {
                        TransactionState::Valid => "Valid",
                        TransactionState::Invalid => "Invalid",
                        TransactionState::InProgress => "InProgress",
                    };
                    (inner_id, name)
                })
                .collect(),
            round,
        }),
        Err(err) => Json(TransactionsStateResponse {
            status: ApiStatus::from_error(&err),
            states: Vec::new(),
            round,
        }),
    }
}

// --- transaction flow ------------------------------------------------------

#[derive(Deserialize)]
struct FlowRequest {
    inner_id: u64,
    source: String,
    target: String,
    amount_integral: i32,
    amount_fraction: u64,
    max_fee: f64,
    signature: String,
    #[serde(default)]
    user_data: Option<Vec<u8>>,
    #[serde(default)]
    smart_contract: Option<SmartContractInvocation>,
}

#[derive(Serialize)]
struct FlowResponseDto {
    status: ApiStatus,
    round: u64,
    smart_contract_result: Option<Variant>,
}

impl From<FlowResponse> for FlowResponseDto {
    fn from(response: FlowResponse) -> Self {
        Self {
            status: ApiStatus {
                code: response.code,
                message: response.message,
            },
            round: response.round,
            smart_contract_result: response.smart_result,
        }
    }
}

fn build_flow_transaction(request: &FlowRequest) -> ChainResult<Transaction> {
    let source = parse_address(&request.source)?;
    let target = parse_address(&request.target)?;
    let mut transaction = Transaction::new(
        request.inner_id,
        source,
        target,
        Amount::new(request.amount_integral, request.amount_fraction),
        Commission::from_f64(request.max_fee),
    );
    if let Some(user_data) = &request.user_data {
        transaction.add_user_field(trx_fields::GENERAL_DATA, UserField::Bytes(user_data.clone()));
    }
    let signature = hex::decode(&request.signature)
        .map_err(|err| ChainError::Config(format!("invalid signature encoding: {err}")))?;
    let signature: [u8; 64] = signature
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::Config("signature must be 64 bytes".into()))?;
    transaction.set_signature(signature);
    Ok(transaction)
}

async fn transaction_flow(
    State(state): State<AppState>,
    Json(request): Json<FlowRequest>,
) -> Json<FlowResponseDto> {
    let round = state.node.current_round();
    let transaction = match build_flow_transaction(&request) {
        Ok(transaction) => transaction,
        Err(err) => {
            return Json(FlowResponseDto {
                status: ApiStatus::from_error(&err),
                round,
                smart_contract_result: None,
            });
        }
    };
    let node = state.node.clone();
    let invocation = request.smart_contract;
    // The smart path can suspend on the contract state; keep it off the
    // async workers.
    let result = task::spawn_blocking(move || node.transaction_flow(transaction, invocation)).await;
    match result {
        Ok(Ok(response)) => Json(response.into()),
        Ok(Err(err)) => Json(FlowResponseDto {
            status: ApiStatus::from_error(&err),
            round,
            smart_contract_result: None,
        }),
        Err(err) => Json(FlowResponseDto {
            status: ApiStatus::failure(format!("flow task failed: {err}")),
            round,
            smart_contract_result: None,
        }),
    }
}

// --- pools -----------------------------------------------------------------

#[derive(Serialize)]
struct PoolDto {
    hash: String,
    prev_hash: String,
    sequence: u64,
    transactions_count: u32,
    writer: String,
    total_fee: f64,
}

fn convert_pool(pool: &crate::types::Pool) -> PoolDto {
    let total_fee = pool
        .transactions()
        .iter()
        .map(|transaction| transaction.counted_fee.to_f64())
        .sum();
    PoolDto {
        hash: pool.hash().to_hex(),
        prev_hash: pool.previous_hash().to_hex(),
        sequence: pool.sequence(),
        transactions_count: pool.transaction_count(),
        writer: hex::encode(pool.writer_public_key()),
        total_fee,
    }
}

#[derive(Serialize)]
struct PoolListResponse {
    status: ApiStatus,
    count: u64,
    pools: Vec<PoolDto>,
}

async fn pool_list(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<PoolListResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(PoolListResponse {
            status: ApiStatus::failure("invalid pagination"),
            count: 0,
            pools: Vec::new(),
        });
    }
    match state.node.pool_list(page.offset as u64, page.limit as u64) {
        Ok((count, pools)) => Json(PoolListResponse {
            status: ApiStatus::success(),
            count,
            pools: pools.iter().map(convert_pool).collect(),
        }),
        Err(err) => Json(PoolListResponse {
            status: ApiStatus::from_error(&err),
            count: 0,
            pools: Vec::new(),
        }),
    }
}

#[derive(Serialize)]
struct PoolInfoResponse {
    status: ApiStatus,
    found: bool,
    pool: Option<PoolDto>,
}

async fn pool_info(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Json<PoolInfoResponse> {
    let result = PoolHash::from_hex(&hash).and_then(|hash| state.node.store().load_by_hash(&hash));
    match result {
        Ok(Some(pool)) => Json(PoolInfoResponse {
            status: ApiStatus::success(),
            found: true,
            pool: Some(convert_pool(&pool)),
        }),
        Ok(None) => Json(PoolInfoResponse {
            status: ApiStatus::not_found(),
            found: false,
            pool: None,
        }),
        Err(err) => Json(PoolInfoResponse {
            status: ApiStatus::from_error(&err),
            found: false,
            pool: None,
        }),
    }
}

async fn pool_transactions(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(page): Query<PageQuery>,
) -> Json<TransactionsResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(TransactionsResponse {
            status: ApiStatus::failure("invalid pagination"),
            transactions: Vec::new(),
        });
    }
    let result = PoolHash::from_hex(&hash).and_then(|hash| state.node.store().load_by_hash(&hash));
    match result {
        Ok(Some(pool)) => {
            let transactions = pool
                .transactions()
                .iter()
                .enumerate()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .map(|(index, transaction)| {
                    convert_transaction(&state, &pool.transaction_id(index as u32), transaction)
                })
                .collect();
            Json(TransactionsResponse {
                status: ApiStatus::success(),
                transactions,
            })
        }
        Ok(None) => Json(TransactionsResponse {
            status: ApiStatus::not_found(),
            transactions: Vec::new(),
        }),
        Err(err) => Json(TransactionsResponse {
            status: ApiStatus::from_error(&err),
            transactions: Vec::new(),
        }),
    }
}

// --- smart contracts -------------------------------------------------------

#[derive(Serialize)]
struct SmartContractDto {
    address: String,
    deployer: String,
    source_code: String,
    hash_state: String,
    object_state: Option<String>,
    token_standard: &'static str,
    deploy_transaction: TransactionIdDto,
}

fn fetch_contract(state: &AppState, contract: &[u8; PUBLIC_KEY_SIZE]) -> Option<SmartContractDto> {
    let origin_id = state.node.tracker().origin(contract)?;
    let deploy = state.node.store().load_transaction(&origin_id).ok()??;
    let invocation = deploy.invocation()?;
    let deployer = state
        .node
        .wallets()
        .resolve(&deploy.source)
        .map(hex::encode)
        .unwrap_or_else(|| deploy.source.to_string());
    let object_state = state
        .node
        .tracker()
        .contract_state(contract)
        .map(|snapshot| hex::encode(snapshot.state));
    let token_standard = match state.node.tracker().tokens().token_standard(contract) {
        crate::tokens::TokenStandard::NotAToken => "NotAToken",
        crate::tokens::TokenStandard::Basic => "Basic",
        crate::tokens::TokenStandard::Extended => "Extended",
    };
    Some(SmartContractDto {
        address: hex::encode(contract),
        deployer,
        source_code: invocation.source_code,
        hash_state: invocation.hash_state,
        object_state,
        token_standard,
        deploy_transaction: (&origin_id).into(),
    })
}

#[derive(Serialize)]
struct SmartContractResponse {
    status: ApiStatus,
    contract: Option<SmartContractDto>,
}

async fn contract_get(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<SmartContractResponse> {
    let contract = parse_key(&address)
        .ok()
        .and_then(|key| fetch_contract(&state, &key));
    match contract {
        Some(contract) => Json(SmartContractResponse {
            status: ApiStatus::success(),
            contract: Some(contract),
        }),
        None => Json(SmartContractResponse {
            status: ApiStatus::not_found(),
            contract: None,
        }),
    }
}

#[derive(Serialize)]
struct SmartContractsListResponse {
    status: ApiStatus,
    count: u32,
    contracts: Vec<SmartContractDto>,
}

async fn contracts_by_deployer(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<SmartContractsListResponse> {
    let Ok(deployer) = parse_key(&address) else {
        return Json(SmartContractsListResponse {
            status: ApiStatus::failure("invalid deployer key"),
            count: 0,
            contracts: Vec::new(),
        });
    };
    let ids = state.node.tracker().deployed_by(&deployer);
    let mut contracts = Vec::new();
    for id in &ids {
        let deploy = state.node.store().load_transaction(id).ok().flatten();
        let contract_key = deploy
            .as_ref()
            .and_then(|transaction| state.node.wallets().resolve(&transaction.target));
        if let Some(contract_key) = contract_key {
            if let Some(contract) = fetch_contract(&state, &contract_key) {
                contracts.push(contract);
            }
        }
    }
    Json(SmartContractsListResponse {
        status: ApiStatus::success(),
        count: ids.len() as u32,
        contracts,
    })
}

async fn contracts_all(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<SmartContractsListResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(SmartContractsListResponse {
            status: ApiStatus::failure("invalid pagination"),
            count: 0,
            contracts: Vec::new(),
        });
    }
    let mut origins = state.node.tracker().origins_snapshot();
    origins.sort_by(|a, b| a.0.cmp(&b.0));
    let count = origins.len() as u32;
    let contracts = origins
        .iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .filter_map(|(contract, _)| fetch_contract(&state, contract))
        .collect();
    Json(SmartContractsListResponse {
        status: ApiStatus::success(),
        count,
        contracts,
    })
}

#[derive(Serialize)]
struct ContractAddressesResponse {
    status: ApiStatus,
    addresses: Vec<String>,
}

async fn contract_addresses(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<ContractAddressesResponse> {
    let Ok(deployer) = parse_key(&address) else {
        return Json(ContractAddressesResponse {
            status: ApiStatus::failure("invalid deployer key"),
            addresses: Vec::new(),
        });
    };
    let mut addresses = Vec::new();
    for id in state.node.tracker().deployed_by(&deployer) {
        if let Ok(Some(deploy)) = state.node.store().load_transaction(&id) {
            if let Some(contract) = state.node.wallets().resolve(&deploy.target) {
                addresses.push(hex::encode(contract));
            }
        }
    }
    Json(ContractAddressesResponse {
        status: ApiStatus::success(),
        addresses,
    })
}

#[derive(Deserialize)]
struct MethodParamsQuery {
    inner_id: u64,
}

#[derive(Serialize)]
struct MethodParamsResponse {
    status: ApiStatus,
    method: Option<String>,
    params: Vec<Variant>,
}

async fn contract_method_params(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<MethodParamsQuery>,
) -> Json<MethodParamsResponse> {
    let found = parse_address(&address).ok().and_then(|address| {
        state
            .node
            .store()
            .find_transaction(&address, query.inner_id)
            .ok()
            .flatten()
    });
    let invocation = found.and_then(|(_, transaction)| transaction.invocation());
    match invocation {
        Some(invocation) => Json(MethodParamsResponse {
            status: ApiStatus::success(),
            method: Some(invocation.method),
            params: invocation.params,
        }),
        None => Json(MethodParamsResponse {
            status: ApiStatus::failure("no invocation for that transaction"),
            method: None,
            params: Vec::new(),
        }),
    }
}

#[derive(Deserialize)]
struct CompileRequest {
    source_code: String,
}

#[derive(Serialize)]
struct CompileResponse {
    status: ApiStatus,
    token_standard: Option<&'static str>,
    bytecode_objects: Vec<crate::types::ByteCodeObject>,
}

async fn contract_compile(
    State(state): State<AppState>,
    Json(request): Json<CompileRequest>,
) -> Json<CompileResponse> {
    let executor = state.node.executor().clone();
    let result =
        task::spawn_blocking(move || executor.compile_source_code(&request.source_code)).await;
    let compiled = match result {
        Ok(Ok(compiled)) => compiled,
        Ok(Err(err)) => {
            return Json(CompileResponse {
                status: ApiStatus::from_error(&err),
                token_standard: None,
                bytecode_objects: Vec::new(),
            });
        }
        Err(err) => {
            return Json(CompileResponse {
                status: ApiStatus::failure(format!("compile task failed: {err}")),
                token_standard: None,
                bytecode_objects: Vec::new(),
            });
        }
    };
    if !compiled.status.is_ok() {
        return Json(CompileResponse {
            status: ApiStatus {
                code: compiled.status.code,
                message: compiled.status.message,
            },
            token_standard: None,
            bytecode_objects: Vec::new(),
        });
    }
    let standard = state
        .node
        .executor()
        .get_contract_methods(&compiled.bytecode_objects)
        .ok()
        .map(|methods| match crate::tokens::standard_of(&methods.methods) {
            crate::tokens::TokenStandard::NotAToken => "NotAToken",
            crate::tokens::TokenStandard::Basic => "Basic",
            crate::tokens::TokenStandard::Extended => "Extended",
        });
    Json(CompileResponse {
        status: ApiStatus::success(),
        token_standard: standard,
        bytecode_objects: compiled.bytecode_objects,
    })
}

#[derive(Serialize)]
struct ContractDataResponse {
    status: ApiStatus,
    methods: Vec<crate::interfaces::ContractMethod>,
    variables: std::collections::BTreeMap<String, Variant>,
}

async fn contract_data(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<ContractDataResponse> {
    let empty = || ContractDataResponse {
        status: ApiStatus::not_found(),
        methods: Vec::new(),
        variables: Default::default(),
    };
    let Ok(contract) = parse_key(&address) else {
        return Json(empty());
    };
    let Some(origin_id) = state.node.tracker().origin(&contract) else {
        return Json(empty());
    };
    let bytecode = state
        .node
        .store()
        .load_transaction(&origin_id)
        .ok()
        .flatten()
        .and_then(|transaction| transaction.invocation())
        .map(|invocation| invocation.bytecode_objects)
        .unwrap_or_default();
    let contract_state = state
        .node
        .tracker()
        .contract_state(&contract)
        .map(|snapshot| snapshot.state)
        .unwrap_or_default();
    let executor = state.node.executor().clone();
    let result = task::spawn_blocking(move || {
        let methods = executor.get_contract_methods(&bytecode)?;
        let variables = executor.get_contract_variables(&bytecode, &contract_state)?;
        Ok::<_, ChainError>((methods, variables))
    })
    .await;
    match result {
        Ok(Ok((methods, variables))) => {
            if !methods.status.is_ok() {
                return Json(ContractDataResponse {
                    status: ApiStatus {
                        code: methods.status.code,
                        message: methods.status.message,
                    },
                    methods: Vec::new(),
                    variables: Default::default(),
                });
            }
            Json(ContractDataResponse {
                status: ApiStatus::success(),
                methods: methods.methods,
                variables: variables.variables,
            })
        }
        Ok(Err(err)) => Json(ContractDataResponse {
            status: ApiStatus::from_error(&err),
            methods: Vec::new(),
            variables: Default::default(),
        }),
        Err(err) => Json(ContractDataResponse {
            status: ApiStatus::failure(format!("contract data task failed: {err}")),
            methods: Vec::new(),
            variables: Default::default(),
        }),
    }
}

#[derive(Deserialize)]
struct WaitQuery {
    #[serde(default = "default_wait_ms")]
    timeout_ms: u64,
}

fn default_wait_ms() -> u64 {
    10_000
}

#[derive(Serialize)]
struct WaitResponse {
    status: ApiStatus,
    transaction: Option<TransactionIdDto>,
}

async fn wait_for_smart_transaction(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Json<WaitResponse> {
    let Ok(contract) = parse_key(&address) else {
        return Json(WaitResponse {
            status: ApiStatus::failure("invalid contract key"),
            transaction: None,
        });
    };
    let node = state.node.clone();
    let timeout = Duration::from_millis(query.timeout_ms);
    let result = task::spawn_blocking(move || {
        node.tracker().wait_for_smart_transaction(contract, timeout)
    })
    .await;
    match result {
        Ok(Some(id)) => Json(WaitResponse {
            status: ApiStatus::success(),
            transaction: Some((&id).into()),
        }),
        Ok(None) => Json(WaitResponse {
            status: ApiStatus::in_progress(),
            transaction: None,
        }),
        Err(err) => Json(WaitResponse {
            status: ApiStatus::failure(format!("wait task failed: {err}")),
            transaction: None,
        }),
    }
}

#[derive(Deserialize)]
struct ExecuteCountQuery {
    method: String,
}

#[derive(Serialize)]
struct ExecuteCountResponse {
    status: ApiStatus,
    count: Option<u64>,
}

async fn execute_count(
    State(state): State<AppState>,
    Query(query): Query<ExecuteCountQuery>,
) -> Json<ExecuteCountResponse> {
    match state.node.tracker().execute_count(&query.method) {
        Some(count) => Json(ExecuteCountResponse {
            status: ApiStatus::success(),
            count: Some(count),
        }),
        None => Json(ExecuteCountResponse {
            status: ApiStatus::not_found(),
            count: None,
        }),
    }
}

// --- tokens ----------------------------------------------------------------

#[derive(Serialize)]
struct TokenInfoDto {
    address: String,
    name: String,
    code: String,
    total_supply: String,
    owner: String,
    standard: &'static str,
    transfers_count: u64,
    transactions_count: u64,
    holders_count: u64,
}

fn token_dto(address: &[u8; PUBLIC_KEY_SIZE], token: &crate::tokens::Token) -> TokenInfoDto {
    TokenInfoDto {
        address: hex::encode(address),
        name: token.name.clone(),
        code: token.symbol.clone(),
        total_supply: token.total_supply.clone(),
        owner: hex::encode(token.owner),
        standard: match token.standard {
            crate::tokens::TokenStandard::NotAToken => "NotAToken",
            crate::tokens::TokenStandard::Basic => "Basic",
            crate::tokens::TokenStandard::Extended => "Extended",
        },
        transfers_count: token.transfers_count,
        transactions_count: token.transactions_count,
        holders_count: token.real_holders_count() as u64,
    }
}

#[derive(Serialize)]
struct TokenListResponse {
    status: ApiStatus,
    count: u64,
    tokens: Vec<TokenInfoDto>,
}

async fn token_list(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<TokenListResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(TokenListResponse {
            status: ApiStatus::failure("invalid pagination"),
            count: 0,
            tokens: Vec::new(),
        });
    }
    let mut tokens = state.node.tracker().tokens().tokens_snapshot();
    tokens.sort_by(|a, b| a.0.cmp(&b.0));
    let count = tokens.len() as u64;
    let page_tokens = tokens
        .iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .map(|(address, token)| token_dto(address, token))
        .collect();
    Json(TokenListResponse {
        status: ApiStatus::success(),
        count,
        tokens: page_tokens,
    })
}

#[derive(Serialize)]
struct TokenInfoResponse {
    status: ApiStatus,
    token: Option<TokenInfoDto>,
}

async fn token_info(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<TokenInfoResponse> {
    let token = parse_key(&address)
        .ok()
        .and_then(|key| {
            state
                .node
                .tracker()
                .tokens()
                .token_info(&key)
                .map(|token| token_dto(&key, &token))
        });
    match token {
        Some(token) => Json(TokenInfoResponse {
            status: ApiStatus::success(),
            token: Some(token),
        }),
        None => Json(TokenInfoResponse {
            status: ApiStatus::failure("token not found"),
            token: None,
        }),
    }
}

#[derive(Deserialize)]
struct HoldersQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    order_by_balance: bool,
    #[serde(default)]
    desc: bool,
}

#[derive(Serialize)]
struct TokenHolderDto {
    holder: String,
    balance: String,
    transfers_count: u64,
}

#[derive(Serialize)]
struct TokenHoldersResponse {
    status: ApiStatus,
    count: u64,
    holders: Vec<TokenHolderDto>,
}

async fn token_holders(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<HoldersQuery>,
) -> Json<TokenHoldersResponse> {
    if !NodeHandle::validate_pagination(query.offset, query.limit) {
        return Json(TokenHoldersResponse {
            status: ApiStatus::failure("invalid pagination"),
            count: 0,
            holders: Vec::new(),
        });
    }
    let holders = parse_key(&address).ok().and_then(|key| {
        state.node.tracker().tokens().holders_of(
            &key,
            query.order_by_balance,
            query.desc,
            query.offset as usize,
            query.limit as usize,
        )
    });
    match holders {
        Some((count, holders)) => Json(TokenHoldersResponse {
            status: ApiStatus::success(),
            count: count as u64,
            holders: holders
                .into_iter()
                .filter(|(_, info)| !is_zero_amount(&info.balance) || info.transfers_count > 0)
                .map(|(holder, info)| TokenHolderDto {
                    holder: hex::encode(holder),
                    balance: info.balance,
                    transfers_count: info.transfers_count,
                })
                .collect(),
        }),
        None => Json(TokenHoldersResponse {
            status: ApiStatus::failure("token not found"),
            count: 0,
            holders: Vec::new(),
        }),
    }
}

#[derive(Serialize)]
struct TokenBalanceDto {
    token: String,
    code: String,
    name: String,
    balance: String,
}

#[derive(Serialize)]
struct TokenBalancesResponse {
    status: ApiStatus,
    balances: Vec<TokenBalanceDto>,
}

async fn wallet_token_balances(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Json<TokenBalancesResponse> {
    let Ok(holder) = parse_key(&address) else {
        return Json(TokenBalancesResponse {
            status: ApiStatus::failure("invalid wallet key"),
            balances: Vec::new(),
        });
    };
    let balances = state
        .node
        .tracker()
        .tokens()
        .balances_of(&holder)
        .into_iter()
        .map(|(token, info, holder_info)| TokenBalanceDto {
            token: hex::encode(token),
            code: info.symbol.clone(),
            name: info.name,
            balance: holder_info.balance,
        })
        .collect();
    Json(TokenBalancesResponse {
        status: ApiStatus::success(),
        balances,
    })
}

#[derive(Serialize)]
struct TokenTransferDto {
    token: String,
    code: String,
    sender: String,
    receiver: String,
    amount: String,
    initiator: String,
    transaction: TransactionIdDto,
}

#[derive(Serialize)]
struct TokenTransfersResponse {
    status: ApiStatus,
    count: u64,
    transfers: Vec<TokenTransferDto>,
}

async fn token_transfers(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Json<TokenTransfersResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(TokenTransfersResponse {
            status: ApiStatus::failure("invalid pagination"),
            count: 0,
            transfers: Vec::new(),
        });
    }
    let Ok(token_key) = parse_key(&address) else {
        return Json(TokenTransfersResponse {
            status: ApiStatus::failure("invalid token key"),
            count: 0,
            transfers: Vec::new(),
        });
    };
    let Some(token) = state.node.tracker().tokens().token_info(&token_key) else {
        return Json(TokenTransfersResponse {
            status: ApiStatus::failure("token not found"),
            count: 0,
            transfers: Vec::new(),
        });
    };
    let found = state
        .node
        .token_transactions(&token_key, true, page.offset as usize, page.limit as usize);
    match found {
        Ok(entries) => Json(TokenTransfersResponse {
            status: ApiStatus::success(),
            count: token.transfers_count,
            transfers: entries
                .into_iter()
                .filter_map(|(id, transaction, invocation)| {
                    let initiator = state.node.wallets().resolve(&transaction.source)?;
                    let (sender, receiver) = crate::tokens::transfer_data(
                        &initiator,
                        &invocation.method,
                        &invocation.params,
                    )?;
                    Some(TokenTransferDto {
                        token: hex::encode(token_key),
                        code: token.symbol.clone(),
                        sender: hex::encode(sender),
                        receiver: hex::encode(receiver),
                        amount: crate::tokens::transfer_amount(&invocation),
                        initiator: hex::encode(initiator),
                        transaction: (&id).into(),
                    })
                })
                .collect(),
        }),
        Err(err) => Json(TokenTransfersResponse {
            status: ApiStatus::from_error(&err),
            count: 0,
            transfers: Vec::new(),
        }),
    }
}

#[derive(Serialize)]
struct TokenTransactionDto {
    token: String,
    initiator: String,
    method: String,
    params: Vec<Variant>,
    transaction: TransactionIdDto,
}

#[derive(Serialize)]
struct TokenTransactionsResponse {
    status: ApiStatus,
    count: u64,
    transactions: Vec<TokenTransactionDto>,
}

async fn token_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Json<TokenTransactionsResponse> {
    if !NodeHandle::validate_pagination(page.offset, page.limit) {
        return Json(TokenTransactionsResponse {
            status: ApiStatus::failure("invalid pagination"),
            count: 0,
            transactions: Vec::new(),
        });
    }
    let Ok(token_key) = parse_key(&address) else {
        return Json(TokenTransactionsResponse {
            status: ApiStatus::failure("invalid token key"),
            count: 0,
            transactions: Vec::new(),
        });
    };
    let Some(token) = state.node.tracker().tokens().token_info(&token_key) else {
        return Json(TokenTransactionsResponse {
            status: ApiStatus::failure("token not found"),
            count: 0,
            transactions: Vec::new(),
        });
    };
    let found = state
        .node
        .token_transactions(&token_key, false, page.offset as usize, page.limit as usize);
    match found {
        Ok(entries) => Json(TokenTransactionsResponse {
            status: ApiStatus::success(),
            count: token.transactions_count,
            transactions: entries
                .into_iter()
                .map(|(id, transaction, invocation)| TokenTransactionDto {
                    token: hex::encode(token_key),
                    initiator: state
                        .node
                        .wallets()
                        .resolve(&transaction.source)
                        .map(hex::encode)
                        .unwrap_or_else(|| transaction.source.to_string()),
                    method: invocation.method.clone(),
                    params: invocation.params.clone(),
                    transaction: (&id).into(),
                })
                .collect(),
        }),
        Err(err) => Json(TokenTransactionsResponse {
            status: ApiStatus::from_error(&err),
            count: 0,
            transactions: Vec::new(),
        }),
    }
}
