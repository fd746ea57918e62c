//! Standard script templates
//!
//! The solver recognises the output forms a relaying node is willing to
//! forward. Anything else is `NonStandard`: valid in blocks, not relayed.

use crate::constants::{MAX_STANDARD_MULTISIG_KEYS, MAX_STANDARD_SCRIPT_SIG_SIZE};
use crate::script::*;
use crate::types::{ByteString, Transaction};

/// Recognised scriptPubKey forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptTemplate {
    /// `<pubkey> OP_CHECKSIG`
    PubKey(ByteString),
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    PubKeyHash([u8; 20]),
    /// `OP_HASH160 <20> OP_EQUAL`
    ScriptHash([u8; 20]),
    /// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`
    Multisig { required: u8, keys: Vec<ByteString> },
    NonStandard,
}

impl ScriptTemplate {
    /// Number of scriptSig pushes needed to satisfy the template; `None` for
    /// non-standard scripts
    pub fn args_expected(&self) -> Option<usize> {
        match self {
            ScriptTemplate::PubKey(_) => Some(1),
            ScriptTemplate::PubKeyHash(_) => Some(2),
            ScriptTemplate::ScriptHash(_) => Some(1),
            ScriptTemplate::Multisig { required, .. } => Some(*required as usize + 1),
            ScriptTemplate::NonStandard => None,
        }
    }

    pub fn is_standard(&self) -> bool {
        match self {
            ScriptTemplate::NonStandard => false,
            ScriptTemplate::Multisig { keys, .. } => keys.len() <= MAX_STANDARD_MULTISIG_KEYS,
            _ => true,
        }
    }
}

fn is_pubkey(data: &[u8]) -> bool {
    (33..=65).contains(&data.len())
}

/// Solver: classify a scriptPubKey
pub fn solve(script: &[u8]) -> ScriptTemplate {
    if is_pay_to_script_hash(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return ScriptTemplate::ScriptHash(hash);
    }

    let Ok(ops) = Instructions::new(script).collect::<Result<Vec<_>, _>>() else {
        return ScriptTemplate::NonStandard;
    };

    match ops.as_slice() {
        [key, sig] if sig.opcode == OP_CHECKSIG => match key.data {
            Some(data) if is_pubkey(data) => ScriptTemplate::PubKey(data.to_vec()),
            _ => ScriptTemplate::NonStandard,
        },
        [dup, hash160, hash, equalverify, checksig]
            if dup.opcode == OP_DUP
                && hash160.opcode == OP_HASH160
                && equalverify.opcode == OP_EQUALVERIFY
                && checksig.opcode == OP_CHECKSIG =>
        {
            match hash.data {
                Some(data) if data.len() == 20 => {
                    let mut out = [0u8; 20];
                    out.copy_from_slice(data);
                    ScriptTemplate::PubKeyHash(out)
                }
                _ => ScriptTemplate::NonStandard,
            }
        }
        [first, keys @ .., last, checkmultisig] if checkmultisig.opcode == OP_CHECKMULTISIG => {
            let (Some(required), Some(total)) = (decode_small_int(first.opcode), decode_small_int(last.opcode))
            else {
                return ScriptTemplate::NonStandard;
            };
            if required < 1 || required > total || keys.len() != total as usize {
                return ScriptTemplate::NonStandard;
            }
            let mut pubkeys = Vec::with_capacity(keys.len());
            for key in keys {
                match key.data {
                    Some(data) if is_pubkey(data) => pubkeys.push(data.to_vec()),
                    _ => return ScriptTemplate::NonStandard,
                }
            }
            ScriptTemplate::Multisig { required, keys: pubkeys }
        }
        _ => ScriptTemplate::NonStandard,
    }
}

/// Pay-to-pubkey-hash locking script
pub fn pay_to_pubkey_hash(hash: &[u8; 20]) -> ByteString {
    let mut script = vec![OP_DUP, OP_HASH160, 20];
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// Pay-to-pubkey locking script
pub fn pay_to_pubkey(pubkey: &[u8]) -> ByteString {
    let mut script = push_data(pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// Pay-to-script-hash locking script
pub fn pay_to_script_hash(redeem_script: &[u8]) -> ByteString {
    let mut script = vec![OP_HASH160, 20];
    script.extend_from_slice(&hash160(redeem_script));
    script.push(OP_EQUAL);
    script
}

/// IsStandard: relay policy for a transaction's own scripts
///
/// 1. Version must be current
/// 2. Every scriptSig is push-only and at most 500 bytes
/// 3. Every output script matches a standard template and is not dust-empty
pub fn is_standard_tx(tx: &Transaction) -> Result<(), &'static str> {
    if tx.version > Transaction::CURRENT_VERSION || tx.version < 1 {
        return Err("version");
    }
    for input in &tx.inputs {
        if input.script_sig.len() > MAX_STANDARD_SCRIPT_SIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }
    for output in &tx.outputs {
        if !solve(&output.script_pubkey).is_standard() {
            return Err("scriptpubkey");
        }
        if output.value == 0 {
            return Err("dust");
        }
    }
    Ok(())
}

/// AreInputsStandard: each scriptSig supplies exactly the pushes its previous
/// output's template expects (redeem scripts included for pay-to-script-hash)
pub fn are_inputs_standard(tx: &Transaction, prev_scripts: &[&[u8]]) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    for (input, prev_script) in tx.inputs.iter().zip(prev_scripts) {
        let template = solve(prev_script);
        let Some(mut expected) = template.args_expected() else {
            return false;
        };

        let mut stack = Vec::new();
        if eval_script(&input.script_sig, &mut stack, &NoSignatureChecker).is_err() {
            return false;
        }

        if let ScriptTemplate::ScriptHash(_) = template {
            let Some(redeem) = stack.last() else {
                return false;
            };
            let inner = solve(redeem);
            match inner {
                ScriptTemplate::ScriptHash(_) => return false,
                other => match other.args_expected() {
                    Some(n) => expected += n,
                    None => return false,
                },
            }
        }

        if stack.len() != expected {
            return false;
        }
    }
    true
}
