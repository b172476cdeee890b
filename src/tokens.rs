//! Derived index over contracts implementing the token interface.
//!
//! Deploys are probed through the executor's method table; invokes whose
//! method is a transfer update holder and transfer counters. The index is
//! fed exclusively by the tracker worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{public_key_bytes_from_hex, PUBLIC_KEY_SIZE};
use crate::interfaces::{ContractMethod, Executor};
use crate::types::{SmartContractInvocation, Variant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStandard {
    NotAToken,
    Basic,
    Extended,
}

const BASIC_METHODS: [&str; 5] = ["getName", "getSymbol", "totalSupply", "balanceOf", "transfer"];
const EXTENDED_METHODS: [&str; 3] = ["allowance", "approve", "transferFrom"];

pub fn standard_of(methods: &[ContractMethod]) -> TokenStandard {
    let names: HashSet<&str> = methods.iter().map(|method| method.name.as_str()).collect();
    if !BASIC_METHODS.iter().all(|name| names.contains(name)) {
        return TokenStandard::NotAToken;
    }
    if EXTENDED_METHODS.iter().all(|name| names.contains(name)) {
        TokenStandard::Extended
    } else {
        TokenStandard::Basic
    }
}

pub fn is_transfer(method: &str, params: &[Variant]) -> bool {
    match method {
        "transfer" => params.len() >= 2,
        "transferFrom" => params.len() >= 3,
        _ => false,
    }
}

/// `(sender, receiver)` of a transfer-like invocation, resolved from the
/// initiator and the textual address parameters.
pub fn transfer_data(
    initiator: &[u8; PUBLIC_KEY_SIZE],
    method: &str,
    params: &[Variant],
) -> Option<([u8; PUBLIC_KEY_SIZE], [u8; PUBLIC_KEY_SIZE])> {
    let parse = |variant: &Variant| -> Option<[u8; PUBLIC_KEY_SIZE]> {
        public_key_bytes_from_hex(variant.as_text()?).ok()
    };
    match method {
        "transfer" => Some((*initiator, parse(params.first()?)?)),
        "transferFrom" => Some((parse(params.first()?)?, parse(params.get(1)?)?)),
        _ => None,
    }
}

pub fn transfer_amount(invocation: &SmartContractInvocation) -> String {
    let position = match invocation.method.as_str() {
        "transfer" => 1,
        "transferFrom" => 2,
        _ => return String::new(),
    };
    invocation
        .params
        .get(position)
        .and_then(Variant::as_text)
        .unwrap_or_default()
        .to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HolderInfo {
    pub balance: String,
    pub transfers_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub name: String,
    pub symbol: String,
    pub total_supply: String,
    pub owner: [u8; PUBLIC_KEY_SIZE],
    pub standard: TokenStandard,
    pub transfers_count: u64,
    pub transactions_count: u64,
    pub holders: HashMap<[u8; PUBLIC_KEY_SIZE], HolderInfo>,
}

impl Token {
    pub fn real_holders_count(&self) -> usize {
        let non_zero = self
            .holders
            .values()
            .filter(|holder| !is_zero_amount(&holder.balance))
            .count();
        // Balances are only as fresh as the executor exposes them; fall back
        // to the holder set when none are tracked.
        if non_zero == 0 {
            self.holders.len()
        } else {
            non_zero
        }
    }
}

pub fn is_zero_amount(balance: &str) -> bool {
    balance.is_empty() || balance.chars().all(|c| c == '0' || c == '.')
}

#[derive(Default)]
struct RegistryInner {
    tokens: HashMap<[u8; PUBLIC_KEY_SIZE], Token>,
    holder_tokens: HashMap<[u8; PUBLIC_KEY_SIZE], HashSet<[u8; PUBLIC_KEY_SIZE]>>,
}

/// All token knowledge behind one lock; only the tracker writes.
pub struct TokenRegistry {
    inner: Mutex<RegistryInner>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Probes a freshly deployed contract and registers it when its method
    /// table matches the token interface.
    pub fn check_new_deploy(
        &self,
        contract: [u8; PUBLIC_KEY_SIZE],
        deployer: [u8; PUBLIC_KEY_SIZE],
        invocation: &SmartContractInvocation,
        executor: &Arc<dyn Executor>,
    ) {
        let Ok(methods) = executor.get_contract_methods(&invocation.bytecode_objects) else {
            return;
        };
        if !methods.status.is_ok() {
            return;
        }
        let standard = standard_of(&methods.methods);
        if standard == TokenStandard::NotAToken {
            return;
        }
        let (name, symbol, total_supply) = executor
            .get_contract_variables(&invocation.bytecode_objects, &[])
            .ok()
            .filter(|result| result.status.is_ok())
            .map(|result| {
                let text = |key: &str| {
                    result
                        .variables
                        .get(key)
                        .and_then(Variant::as_text)
                        .unwrap_or_default()
                        .to_string()
                };
                (text("name"), text("symbol"), text("totalSupply"))
            })
            .unwrap_or_default();
        debug!(contract = %hex::encode(contract), ?standard, "registered token contract");
        self.inner.lock().tokens.insert(
            contract,
            Token {
                name,
                symbol,
                total_supply,
                owner: deployer,
                standard,
                transfers_count: 0,
                transactions_count: 0,
                holders: HashMap::new(),
            },
        );
    }

    /// Folds a successful invocation's new state into the counters and, for
    /// transfers, the holder records.
    pub fn check_new_state(
        &self,
        contract: [u8; PUBLIC_KEY_SIZE],
        caller: [u8; PUBLIC_KEY_SIZE],
        invocation: &SmartContractInvocation,
        new_state: &[u8],
        executor: &Arc<dyn Executor>,
    ) {
        {
            let inner = self.inner.lock();
            if !inner.tokens.contains_key(&contract) {
                return;
            }
        }
        // Refresh the supply outside the lock; the executor may be slow.
        let total_supply = executor
            .get_contract_variables(&[], new_state)
            .ok()
            .filter(|result| result.status.is_ok())
            .and_then(|result| {
                result
                    .variables
                    .get("totalSupply")
                    .and_then(Variant::as_text)
                    .map(str::to_string)
            });

        let mut inner = self.inner.lock();
        let Some(token) = inner.tokens.get_mut(&contract) else {
            return;
        };
        token.transactions_count += 1;
        if let Some(total_supply) = total_supply {
            token.total_supply = total_supply;
        }
        if !is_transfer(&invocation.method, &invocation.params) {
            return;
        }
        let Some((sender, receiver)) = transfer_data(&caller, &invocation.method, &invocation.params)
        else {
            return;
        };
        token.transfers_count += 1;
        for holder in [sender, receiver] {
            token.holders.entry(holder).or_default().transfers_count += 1;
        }
        for holder in [sender, receiver] {
            inner
                .holder_tokens
                .entry(holder)
                .or_default()
                .insert(contract);
        }
    }

    pub fn is_token(&self, contract: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.inner.lock().tokens.contains_key(contract)
    }

    pub fn token_info(&self, contract: &[u8; PUBLIC_KEY_SIZE]) -> Option<Token> {
        self.inner.lock().tokens.get(contract).cloned()
    }

    pub fn token_standard(&self, contract: &[u8; PUBLIC_KEY_SIZE]) -> TokenStandard {
        self.inner
            .lock()
            .tokens
            .get(contract)
            .map(|token| token.standard)
            .unwrap_or(TokenStandard::NotAToken)
    }

    /// Non-zero token balances held by `holder`.
    pub fn balances_of(
        &self,
        holder: &[u8; PUBLIC_KEY_SIZE],
    ) -> Vec<([u8; PUBLIC_KEY_SIZE], Token, HolderInfo)> {
        let inner = self.inner.lock();
        let Some(token_set) = inner.holder_tokens.get(holder) else {
            return Vec::new();
        };
        token_set
            .iter()
            .filter_map(|address| {
                let token = inner.tokens.get(address)?;
                let info = token.holders.get(holder)?.clone();
                Some((*address, token.clone(), info))
            })
            .collect()
    }

    /// Holder records of a token, sorted and paged.
    pub fn holders_of(
        &self,
        contract: &[u8; PUBLIC_KEY_SIZE],
        by_balance: bool,
        descending: bool,
        offset: usize,
        limit: usize,
    ) -> Option<(usize, Vec<([u8; PUBLIC_KEY_SIZE], HolderInfo)>)> {
        let inner = self.inner.lock();
        let token = inner.tokens.get(contract)?;
        let mut holders: Vec<([u8; PUBLIC_KEY_SIZE], HolderInfo)> = token
            .holders
            .iter()
            .map(|(holder, info)| (*holder, info.clone()))
            .collect();
        if by_balance {
            holders.sort_by(|a, b| {
                let left = a.1.balance.parse::<f64>().unwrap_or(0.0);
                let right = b.1.balance.parse::<f64>().unwrap_or(0.0);
                left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            holders.sort_by_key(|(_, info)| info.transfers_count);
        }
        if descending {
            holders.reverse();
        }
        let total = holders.len();
        Some((
            total,
            holders.into_iter().skip(offset).take(limit).collect(),
        ))
    }

    pub fn tokens_snapshot(&self) -> Vec<([u8; PUBLIC_KEY_SIZE], Token)> {
        self.inner
            .lock()
            .tokens
            .iter()
            .map(|(address, token)| (*address, token.clone()))
            .collect()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::MockExecutor;

    fn token_executor() -> Arc<dyn Executor> {
        Arc::new(MockExecutor::with_methods(&[
            "getName",
            "getSymbol",
            "totalSupply",
            "balanceOf",
            "transfer",
        ]))
    }

    #[test]
    fn detects_token_standards() {
        let basic = MockExecutor::with_methods(&BASIC_METHODS);
        assert_eq!(
            standard_of(&basic.methods.lock()),
            TokenStandard::Basic,
        );
        let mut all: Vec<&str> = BASIC_METHODS.to_vec();
        all.extend_from_slice(&EXTENDED_METHODS);
        let extended = MockExecutor::with_methods(&all);
        assert_eq!(
            standard_of(&extended.methods.lock()),
            TokenStandard::Extended,
        );
        let none = MockExecutor::with_methods(&["foo"]);
        assert_eq!(
            standard_of(&none.methods.lock()),
            TokenStandard::NotAToken,
        );
    }

    #[test]
    fn registers_deploys_and_counts_transfers() {
        let registry = TokenRegistry::new();
        let executor = token_executor();
        let contract = [1u8; 32];
        let deployer = [2u8; 32];
        let receiver = [3u8; 32];

        registry.check_new_deploy(
            contract,
            deployer,
            &SmartContractInvocation::default(),
            &executor,
        );
        assert!(registry.is_token(&contract));

        let invocation = SmartContractInvocation {
            method: "transfer".into(),
            params: vec![
                Variant::Text(hex::encode(receiver)),
                Variant::Text("10".into()),
            ],
            ..SmartContractInvocation::default()
        };
        registry.check_new_state(contract, deployer, &invocation, b"s1", &executor);

        let token = registry.token_info(&contract).unwrap();
        assert_eq!(token.transfers_count, 1);
        assert_eq!(token.transactions_count, 1);
        assert_eq!(token.holders.len(), 2);

        let balances = registry.balances_of(&receiver);
        assert_eq!(balances.len(), 1);

        let (total, page) = registry
            .holders_of(&contract, false, true, 0, 10)
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn non_token_deploys_are_ignored() {
        let registry = TokenRegistry::new();
        let executor: Arc<dyn Executor> = Arc::new(MockExecutor::with_methods(&["run"]));
        registry.check_new_deploy(
            [1u8; 32],
            [2u8; 32],
            &SmartContractInvocation::default(),
            &executor,
        );
        assert!(!registry.is_token(&[1u8; 32]));
    }
}
