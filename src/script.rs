//! Script execution engine
//!
//! A stack machine over byte strings. Outputs are locked by a scriptPubKey and
//! unlocked by a scriptSig; an input is valid when running the scriptSig and
//! then the scriptPubKey on the resulting stack leaves a true value on top.
//! Pay-to-script-hash outputs additionally run the serialized redeem script
//! found on top of the scriptSig stack.
//!
//! All resource caps (script size, element size, operation count, stack depth)
//! are enforced during execution, so evaluation always terminates.

use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::constants::*;
use crate::serialize::{self, Encodable};
use crate::types::*;

// Push value
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;

// Control
pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

// Stack ops
pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;

// Splice ops
pub const OP_CAT: u8 = 0x7e;
pub const OP_SUBSTR: u8 = 0x7f;
pub const OP_LEFT: u8 = 0x80;
pub const OP_RIGHT: u8 = 0x81;
pub const OP_SIZE: u8 = 0x82;

// Bit logic
pub const OP_INVERT: u8 = 0x83;
pub const OP_AND: u8 = 0x84;
pub const OP_OR: u8 = 0x85;
pub const OP_XOR: u8 = 0x86;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_RESERVED1: u8 = 0x89;
pub const OP_RESERVED2: u8 = 0x8a;

// Numeric
pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_2MUL: u8 = 0x8d;
pub const OP_2DIV: u8 = 0x8e;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_MUL: u8 = 0x95;
pub const OP_DIV: u8 = 0x96;
pub const OP_MOD: u8 = 0x97;
pub const OP_LSHIFT: u8 = 0x98;
pub const OP_RSHIFT: u8 = 0x99;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;

// Crypto
pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

// Expansion
pub const OP_NOP1: u8 = 0xb0;
pub const OP_NOP10: u8 = 0xb9;

/// No optional checks
pub const SCRIPT_VERIFY_NONE: u32 = 0;
/// Evaluate pay-to-script-hash redeem scripts
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
/// Require exactly one element on the final stack
pub const SCRIPT_VERIFY_STRICT: u32 = 1 << 1;

pub const SIGHASH_ALL: u8 = 1;
pub const SIGHASH_NONE: u8 = 2;
pub const SIGHASH_SINGLE: u8 = 3;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;

/// Reasons a script fails
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("script too large")]
    ScriptSize,
    #[error("push exceeds element size limit")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("signature count out of range")]
    SigCount,
    #[error("public key count out of range")]
    PubkeyCount,
    #[error("verify operation failed")]
    Verify,
    #[error("bad opcode")]
    BadOpcode,
    #[error("disabled opcode")]
    DisabledOpcode,
    #[error("stack operation on too few elements")]
    InvalidStackOperation,
    #[error("altstack operation on too few elements")]
    InvalidAltstackOperation,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("numeric operand overflow")]
    NumOverflow,
    #[error("scriptSig is not push-only")]
    SigPushOnly,
    #[error("extra items left on stack")]
    CleanStack,
}

type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// One parsed script operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    /// Pushed bytes, for push operations
    pub data: Option<&'a [u8]>,
}

/// Iterator over the operations of a script; yields an error and stops on a
/// truncated push
pub struct Instructions<'a> {
    script: &'a [u8],
    pc: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self { script, pc: 0, failed: false }
    }

    /// Byte offset of the next operation
    pub fn position(&self) -> usize {
        self.pc
    }

    fn take(&mut self, n: usize) -> ScriptResult<&'a [u8]> {
        if self.script.len() - self.pc < n {
            return Err(ScriptError::BadOpcode);
        }
        let bytes = &self.script[self.pc..self.pc + n];
        self.pc += n;
        Ok(bytes)
    }

    fn next_instruction(&mut self) -> ScriptResult<Instruction<'a>> {
        let opcode = self.take(1)?[0];
        if opcode > OP_PUSHDATA4 {
            return Ok(Instruction { opcode, data: None });
        }
        let len = match opcode {
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let b = self.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = self.take(4)?;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            n => n as usize,
        };
        let data = self.take(len)?;
        Ok(Instruction { opcode, data: Some(data) })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = ScriptResult<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc >= self.script.len() {
            return None;
        }
        let item = self.next_instruction();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Encode `data` as a single push operation
pub fn push_data(data: &[u8]) -> ByteString {
    let mut out = Vec::with_capacity(data.len() + 5);
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

/// Opcode pushing a small integer (0..=16)
pub fn small_int_opcode(n: u8) -> u8 {
    if n == 0 {
        OP_0
    } else {
        OP_1 + n - 1
    }
}

/// Value of OP_0 / OP_1..OP_16
pub fn decode_small_int(opcode: u8) -> Option<u8> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(opcode - OP_1 + 1),
        _ => None,
    }
}

/// Script consists only of push operations
pub fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|ins| matches!(ins, Ok(ins) if ins.opcode <= OP_16))
}

/// OP_HASH160 <20 bytes> OP_EQUAL
pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// Remove every push of `pattern` that starts on an operation boundary
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> ByteString {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut result = Vec::with_capacity(script.len());
    let mut ops = Instructions::new(script);
    loop {
        let mut pc = ops.position();
        while script[pc..].starts_with(pattern) {
            pc += pattern.len();
        }
        if pc >= script.len() {
            break;
        }
        ops.pc = pc;
        match ops.next() {
            Some(Ok(_)) => result.extend_from_slice(&script[pc..ops.position()]),
            _ => {
                result.extend_from_slice(&script[pc..]);
                break;
            }
        }
    }
    result
}

/// Decode a numeric operand: little-endian sign-magnitude, at most four bytes
pub fn decode_num(bytes: &[u8]) -> ScriptResult<i64> {
    if bytes.len() > MAX_NUM_SIZE {
        return Err(ScriptError::NumOverflow);
    }
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        Ok(-(value & mask))
    } else {
        Ok(value)
    }
}

/// Minimal sign-magnitude encoding
pub fn encode_num(value: i64) -> ByteString {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut out = Vec::new();
    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

/// Truthiness of a stack element; negative zero is false
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, b) in bytes.iter().enumerate() {
        if *b != 0 {
            return !(i == bytes.len() - 1 && *b == 0x80);
        }
    }
    false
}

fn bool_item(value: bool) -> ByteString {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

/// SignatureHash
///
/// 1. Copy the transaction and blank every scriptSig
/// 2. Place the script code (without OP_CODESEPARATOR) at the signed input
/// 3. NONE: drop all outputs; SINGLE: keep outputs up to the input index,
///    nulling earlier ones; both zero the other inputs' sequences
/// 4. ANYONECANPAY: keep only the signed input
/// 5. sha256d(serialized copy ‖ 4-byte hash type)
///
/// Out-of-range input, or SINGLE without a matching output, hashes to one.
pub fn signature_hash(script_code: &[u8], tx: &Transaction, input_index: usize, hash_type: u32) -> Hash {
    let mut one = NULL_HASH;
    one[0] = 1;
    if input_index >= tx.inputs.len() {
        return one;
    }

    let mut copy = tx.clone();
    let script_code = find_and_delete(script_code, &[OP_CODESEPARATOR]);
    for input in copy.inputs.iter_mut() {
        input.script_sig.clear();
    }
    copy.inputs[input_index].script_sig = script_code;

    match (hash_type & 0x1f) as u8 {
        SIGHASH_NONE => {
            copy.outputs.clear();
            zero_other_sequences(&mut copy, input_index);
        }
        SIGHASH_SINGLE => {
            if input_index >= copy.outputs.len() {
                return one;
            }
            copy.outputs.truncate(input_index + 1);
            for output in copy.outputs.iter_mut().take(input_index) {
                *output = TransactionOutput::null();
            }
            zero_other_sequences(&mut copy, input_index);
        }
        _ => {}
    }

    if hash_type & SIGHASH_ANYONECANPAY as u32 != 0 {
        let signed = copy.inputs.swap_remove(input_index);
        copy.inputs = vec![signed];
    }

    let mut bytes = Vec::with_capacity(copy.encoded_len() + 4);
    copy.consensus_encode(&mut bytes);
    bytes.extend_from_slice(&hash_type.to_le_bytes());
    serialize::sha256d(&bytes)
}

fn zero_other_sequences(tx: &mut Transaction, input_index: usize) {
    for (i, input) in tx.inputs.iter_mut().enumerate() {
        if i != input_index {
            input.sequence = 0;
        }
    }
}

/// Signature verification seam between the interpreter and the transaction
pub trait SignatureChecker {
    /// `signature` includes the trailing hash-type byte
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool;
}

/// Checker that rejects every signature, for scripts evaluated out of context
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {
    fn check_sig(&self, _signature: &[u8], _pubkey: &[u8], _script_code: &[u8]) -> bool {
        false
    }
}

/// Checks signatures against one input of a transaction
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    secp: Secp256k1<VerifyOnly>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        Self { tx, input_index, secp: Secp256k1::verification_only() }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Some((&hash_type, der)) = signature.split_last() else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(mut sig) = Signature::from_der_lax(der) else {
            return false;
        };
        sig.normalize_s();

        let sighash = signature_hash(script_code, self.tx, self.input_index, hash_type as u32);
        let Ok(message) = Message::from_digest_slice(&sighash) else {
            return false;
        };
        self.secp.verify_ecdsa(&message, &sig, &pubkey).is_ok()
    }
}

fn pop(stack: &mut Vec<ByteString>) -> ScriptResult<ByteString> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

/// Element `depth` from the top (1 = top)
fn top(stack: &[ByteString], depth: usize) -> ScriptResult<&ByteString> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn require(stack: &[ByteString], n: usize) -> ScriptResult<()> {
    if stack.len() < n {
        Err(ScriptError::InvalidStackOperation)
    } else {
        Ok(())
    }
}

fn pop_num(stack: &mut Vec<ByteString>) -> ScriptResult<i64> {
    decode_num(&pop(stack)?)
}

/// EvalScript
///
/// Run `script` on `stack`. Operations inside unexecuted conditional
/// branches are skipped but still parsed and counted; disabled opcodes fail
/// the script wherever they appear.
pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<ByteString>,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut ops = Instructions::new(script);
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut altstack: Vec<ByteString> = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;

    while let Some(instruction) = ops.next() {
        let Instruction { opcode, data } = instruction?;
        let executing = !exec_stack.contains(&false);

        if let Some(data) = data {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && opcode <= OP_PUSHDATA4 {
            stack.push(data.unwrap_or_default().to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = if opcode == OP_1NEGATE { -1 } else { (opcode - OP_1 + 1) as i64 };
                    stack.push(encode_num(n));
                }

                OP_NOP | OP_NOP1..=OP_NOP10 => {}

                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let item = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&item);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let last = exec_stack.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => altstack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let item = altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(item);
                }
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let at = stack.len() - 6;
                    let moved: Vec<ByteString> = stack.drain(at..at + 2).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let n = stack.len();
                    stack.swap(n - 4, n - 2);
                    stack.swap(n - 3, n - 1);
                }
                OP_IFDUP => {
                    let item = top(stack, 1)?;
                    if cast_to_bool(item) {
                        let item = item.clone();
                        stack.push(item);
                    }
                }
                OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let item = top(stack, 1)?.clone();
                    stack.push(item);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    let n = stack.len();
                    stack.remove(n - 2);
                }
                OP_OVER => {
                    let item = top(stack, 2)?.clone();
                    stack.push(item);
                }
                OP_PICK | OP_ROLL => {
                    let n = pop_num(stack)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - n as usize;
                    let item = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(item);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let n = stack.len();
                    let item = stack.remove(n - 3);
                    stack.push(item);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let n = stack.len();
                    stack.swap(n - 2, n - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let item = top(stack, 1)?.clone();
                    let n = stack.len();
                    stack.insert(n - 2, item);
                }

                OP_SIZE => {
                    let len = top(stack, 1)?.len();
                    stack.push(encode_num(len as i64));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(bool_item(equal));
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = pop_num(stack)?;
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(encode_num(result));
                }

                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    require(stack, 2)?;
                    let b = pop_num(stack)?;
                    let a = pop_num(stack)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(encode_num(result));
                    }
                }
                OP_WITHIN => {
                    require(stack, 3)?;
                    let max = pop_num(stack)?;
                    let min = pop_num(stack)?;
                    let x = pop_num(stack)?;
                    stack.push(bool_item(min <= x && x < max));
                }

                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let item = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&item).to_vec(),
                        OP_SHA1 => Sha1::digest(&item).to_vec(),
                        OP_SHA256 => Sha256::digest(&item).to_vec(),
                        OP_HASH160 => hash160(&item).to_vec(),
                        _ => serialize::sha256d(&item).to_vec(),
                    };
                    stack.push(digest);
                }
                OP_CODESEPARATOR => code_start = ops.position(),

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    require(stack, 2)?;
                    let pubkey = pop(stack)?;
                    let signature = pop(stack)?;
                    let script_code = find_and_delete(&script[code_start..], &push_data(&signature));
                    let ok = checker.check_sig(&signature, &pubkey, &script_code);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(bool_item(ok));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = check_multisig(stack, &script[code_start..], checker, &mut op_count)?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(bool_item(ok));
                    }
                }

                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Stack layout, top first: key count, keys, signature count, signatures,
/// and one extra dummy element that is consumed unchecked
fn check_multisig(
    stack: &mut Vec<ByteString>,
    script_code: &[u8],
    checker: &dyn SignatureChecker,
    op_count: &mut usize,
) -> ScriptResult<bool> {
    let mut i = 1usize;
    let key_count = decode_num(top(stack, i)?)?;
    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    let mut key_count = key_count as usize;
    *op_count += key_count;
    if *op_count > MAX_SCRIPT_OPS {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let mut key_pos = i;
    i += key_count;

    let sig_count = decode_num(top(stack, i)?)?;
    if sig_count < 0 || sig_count as usize > key_count {
        return Err(ScriptError::SigCount);
    }
    let mut sig_count = sig_count as usize;
    i += 1;
    let mut sig_pos = i;
    i += sig_count;
    // dummy element
    require(stack, i)?;

    let mut script_code = script_code.to_vec();
    for k in 0..sig_count {
        let signature = top(stack, sig_pos + k)?;
        script_code = find_and_delete(&script_code, &push_data(signature));
    }

    let mut ok = true;
    while ok && sig_count > 0 {
        let signature = top(stack, sig_pos)?;
        let pubkey = top(stack, key_pos)?;
        if checker.check_sig(signature, pubkey, &script_code) {
            sig_pos += 1;
            sig_count -= 1;
        }
        key_pos += 1;
        key_count -= 1;
        if sig_count > key_count {
            ok = false;
        }
    }

    stack.truncate(stack.len() - i);
    Ok(ok)
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

/// VerifyScript, reporting why a script failed
pub fn verify_script_detailed(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: u32,
) -> ScriptResult<()> {
    let checker = TransactionSignatureChecker::new(tx, input_index);
    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, &checker)?;
    let sig_stack = if flags & SCRIPT_VERIFY_P2SH != 0 { stack.clone() } else { Vec::new() };

    eval_script(script_pubkey, &mut stack, &checker)?;
    match stack.last() {
        Some(item) if cast_to_bool(item) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags & SCRIPT_VERIFY_P2SH != 0 && is_pay_to_script_hash(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = sig_stack;
        let redeem_script = stack.pop().ok_or(ScriptError::EvalFalse)?;
        eval_script(&redeem_script, &mut stack, &checker)?;
        match stack.last() {
            Some(item) if cast_to_bool(item) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if flags & SCRIPT_VERIFY_STRICT != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

/// VerifyScript: true iff `script_sig` unlocks `script_pubkey` for input
/// `input_index` of `tx`
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: u32,
) -> bool {
    verify_script_detailed(script_sig, script_pubkey, tx, input_index, flags).is_ok()
}

/// Count signature operations
///
/// Multisig operations count as 20 unless `accurate` and preceded by a
/// small-integer key count.
pub fn sigop_count(script: &[u8], accurate: bool) -> usize {
    let mut count = 0;
    let mut last_opcode = None;
    for instruction in Instructions::new(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(op @ OP_1..=OP_16) if accurate => (op - OP_1 + 1) as usize,
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last_opcode = Some(instruction.opcode);
    }
    count
}

/// Signature operations in the redeem script of a pay-to-script-hash spend
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> usize {
    if !is_pay_to_script_hash(script_pubkey) {
        return sigop_count(script_pubkey, true);
    }
    let mut redeem: &[u8] = &[];
    for instruction in Instructions::new(script_sig) {
        match instruction {
            Ok(ins) if ins.opcode <= OP_16 => redeem = ins.data.unwrap_or(&[]),
            _ => return 0,
        }
    }
    sigop_count(redeem, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn run(script: &[u8]) -> ScriptResult<Vec<ByteString>> {
        let mut stack = Vec::new();
        eval_script(script, &mut stack, &NoSignatureChecker)?;
        Ok(stack)
    }

    fn spending_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput::new(OutPoint::new([5; 32], 0), Vec::new())],
            outputs: vec![TransactionOutput::new(10 * CENT, vec![OP_1])],
            lock_time: 0,
        }
    }

    fn p2pkh(pubkey: &[u8]) -> ByteString {
        let mut script = vec![OP_DUP, OP_HASH160, 20];
        script.extend_from_slice(&hash160(pubkey));
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    fn sign(tx: &Transaction, index: usize, script_code: &[u8], key: &SecretKey) -> ByteString {
        let secp = Secp256k1::new();
        let hash = signature_hash(script_code, tx, index, SIGHASH_ALL as u32);
        let message = Message::from_digest_slice(&hash).unwrap();
        let mut sig = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL);
        sig
    }

    #[test]
    fn test_num_encoding() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(1), vec![1]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-128), vec![0x80, 0x80]);
        assert_eq!(decode_num(&[0x80, 0x80]).unwrap(), -128);
        assert_eq!(decode_num(&[0xff, 0xff, 0xff, 0x7f]).unwrap(), i32::MAX as i64);
        assert_eq!(decode_num(&[1, 2, 3, 4, 5]), Err(ScriptError::NumOverflow));
    }

    #[test]
    fn test_cast_to_bool() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0, 0]));
        assert!(!cast_to_bool(&[0, 0x80]));
        assert!(cast_to_bool(&[0x80, 0]));
        assert!(cast_to_bool(&[1]));
    }

    const OP_2: u8 = OP_1 + 1;
    const OP_3: u8 = OP_1 + 2;
    const OP_5: u8 = OP_1 + 4;

    #[test]
    fn test_arithmetic() {
        let stack = run(&[OP_2, OP_3, OP_ADD, OP_5, OP_NUMEQUAL]).unwrap();
        assert_eq!(stack, vec![vec![1]]);
        let stack = run(&[OP_1, OP_1NEGATE, OP_SUB]).unwrap();
        assert_eq!(stack, vec![vec![2]]);
        let stack = run(&[OP_3, OP_2, OP_5, OP_WITHIN]).unwrap();
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn test_conditionals() {
        let stack = run(&[OP_1, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]).unwrap();
        assert_eq!(stack, vec![vec![2]]);
        let stack = run(&[OP_0, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]).unwrap();
        assert_eq!(stack, vec![vec![3]]);
        assert_eq!(run(&[OP_1, OP_IF, OP_2]), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ENDIF]), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn test_disabled_opcode_fails_in_unexecuted_branch() {
        assert_eq!(run(&[OP_0, OP_IF, OP_CAT, OP_ENDIF]), Err(ScriptError::DisabledOpcode));
        assert_eq!(run(&[OP_0, OP_IF, OP_VERIF, OP_ENDIF]), Err(ScriptError::BadOpcode));
        // a reserved opcode is harmless when skipped
        assert!(run(&[OP_0, OP_IF, OP_RESERVED, OP_ENDIF, OP_1]).is_ok());
        assert_eq!(run(&[OP_RESERVED]), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn test_stack_ops() {
        let stack = run(&[OP_1, OP_2, OP_3, OP_ROT]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_TUCK]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_2, OP_PICK]).unwrap();
        assert_eq!(stack, vec![vec![1], vec![2], vec![3], vec![1]]);
        assert_eq!(run(&[OP_1, OP_5, OP_PICK]), Err(ScriptError::InvalidStackOperation));
        assert_eq!(run(&[OP_FROMALTSTACK]), Err(ScriptError::InvalidAltstackOperation));
        let stack = run(&[OP_1, OP_2, OP_3, OP_5, OP_1, OP_2, OP_2ROT]).unwrap();
        assert_eq!(stack, vec![vec![3], vec![5], vec![1], vec![2], vec![1], vec![2]]);
    }

    #[test]
    fn test_limits() {
        let big = vec![0u8; MAX_SCRIPT_ELEMENT_SIZE + 1];
        assert_eq!(run(&push_data(&big)), Err(ScriptError::PushSize));
        assert_eq!(run(&vec![OP_NOP; MAX_SCRIPT_OPS + 1]), Err(ScriptError::OpCount));
        assert_eq!(run(&vec![OP_NOP; MAX_SCRIPT_SIZE + 1]), Err(ScriptError::ScriptSize));
        assert_eq!(run(&vec![OP_1; MAX_STACK_SIZE + 1]), Err(ScriptError::StackSize));
        // truncated push
        assert_eq!(run(&[OP_PUSHDATA1, 5, 1]), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn test_find_and_delete() {
        let sig = vec![0xaa; 3];
        let mut script = push_data(&sig);
        script.push(OP_CHECKSIG);
        assert_eq!(find_and_delete(&script, &push_data(&sig)), vec![OP_CHECKSIG]);
        // not on an operation boundary
        let inner = vec![OP_PUSHDATA1, 4, 3, 0xaa, 0xaa, 0xaa];
        assert_eq!(find_and_delete(&inner, &push_data(&sig)), inner);
        assert_eq!(find_and_delete(&[OP_CODESEPARATOR, OP_1, OP_CODESEPARATOR], &[OP_CODESEPARATOR]), vec![OP_1]);
    }

    #[test]
    fn test_p2pkh_sign_and_verify() {
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &key).serialize();
        let script_pubkey = p2pkh(&pubkey);

        let mut tx = spending_tx();
        let sig = sign(&tx, 0, &script_pubkey, &key);
        let mut script_sig = push_data(&sig);
        script_sig.extend(push_data(&pubkey));
        tx.inputs[0].script_sig = script_sig.clone();

        assert!(verify_script(&script_sig, &script_pubkey, &tx, 0, SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_STRICT));

        // altering an output invalidates the signature
        let mut altered = tx.clone();
        altered.outputs[0].value += 1;
        assert!(!verify_script(&script_sig, &script_pubkey, &altered, 0, SCRIPT_VERIFY_P2SH));

        // wrong key hash
        let other = p2pkh(&[0x02; 33]);
        assert_eq!(
            verify_script_detailed(&script_sig, &other, &tx, 0, SCRIPT_VERIFY_NONE),
            Err(ScriptError::Verify)
        );
    }

    #[test]
    fn test_multisig_one_of_two() {
        let secp = Secp256k1::new();
        let k1 = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let k2 = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let p1 = PublicKey::from_secret_key(&secp, &k1).serialize();
        let p2 = PublicKey::from_secret_key(&secp, &k2).serialize();

        let mut script_pubkey = vec![OP_1];
        script_pubkey.extend(push_data(&p1));
        script_pubkey.extend(push_data(&p2));
        script_pubkey.extend([OP_2, OP_CHECKMULTISIG]);

        let tx = spending_tx();
        let sig = sign(&tx, 0, &script_pubkey, &k2);
        let mut script_sig = vec![OP_0];
        script_sig.extend(push_data(&sig));
        assert!(verify_script(&script_sig, &script_pubkey, &tx, 0, SCRIPT_VERIFY_STRICT));

        // missing dummy element
        let script_sig = push_data(&sig);
        assert!(!verify_script(&script_sig, &script_pubkey, &tx, 0, SCRIPT_VERIFY_NONE));
    }

    #[test]
    fn test_p2sh() {
        let redeem = vec![OP_2, OP_EQUAL];
        let mut script_pubkey = vec![OP_HASH160, 20];
        script_pubkey.extend_from_slice(&hash160(&redeem));
        script_pubkey.push(OP_EQUAL);
        assert!(is_pay_to_script_hash(&script_pubkey));

        let tx = spending_tx();
        let mut good = vec![OP_2];
        good.extend(push_data(&redeem));
        assert!(verify_script(&good, &script_pubkey, &tx, 0, SCRIPT_VERIFY_P2SH));

        let mut bad = vec![OP_3];
        bad.extend(push_data(&redeem));
        // passes the hash check alone, fails once the redeem script runs
        assert!(verify_script(&bad, &script_pubkey, &tx, 0, SCRIPT_VERIFY_NONE));
        assert!(!verify_script(&bad, &script_pubkey, &tx, 0, SCRIPT_VERIFY_P2SH));

        let mut not_push_only = vec![OP_2, OP_NOP];
        not_push_only.extend(push_data(&redeem));
        assert_eq!(
            verify_script_detailed(&not_push_only, &script_pubkey, &tx, 0, SCRIPT_VERIFY_P2SH),
            Err(ScriptError::SigPushOnly)
        );

        assert_eq!(p2sh_sigop_count(&script_pubkey, &good), 0);
    }

    #[test]
    fn test_strict_clean_stack() {
        let tx = spending_tx();
        assert!(verify_script(&[OP_1, OP_1], &[OP_NOP], &tx, 0, SCRIPT_VERIFY_NONE));
        assert_eq!(
            verify_script_detailed(&[OP_1, OP_1], &[OP_NOP], &tx, 0, SCRIPT_VERIFY_STRICT),
            Err(ScriptError::CleanStack)
        );
    }

    #[test]
    fn test_sighash_single_out_of_range_is_one() {
        let mut tx = spending_tx();
        tx.inputs.push(TransactionInput::new(OutPoint::new([6; 32], 1), Vec::new()));
        let hash = signature_hash(&[OP_1], &tx, 1, SIGHASH_SINGLE as u32);
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(hash, one);
        assert_eq!(signature_hash(&[OP_1], &tx, 5, SIGHASH_ALL as u32), one);
    }

    #[test]
    fn test_sighash_anyonecanpay_ignores_other_inputs() {
        let mut tx = spending_tx();
        tx.inputs.push(TransactionInput::new(OutPoint::new([6; 32], 1), Vec::new()));
        let hash_type = (SIGHASH_ALL | SIGHASH_ANYONECANPAY) as u32;
        let before = signature_hash(&[OP_1], &tx, 0, hash_type);
        tx.inputs[1].prevout.index = 7;
        assert_eq!(signature_hash(&[OP_1], &tx, 0, hash_type), before);
        assert_ne!(signature_hash(&[OP_1], &tx, 0, SIGHASH_ALL as u32), before);
    }

    #[test]
    fn test_sigop_count() {
        let mut multisig = vec![OP_1];
        multisig.extend(push_data(&[2; 33]));
        multisig.extend([OP_1, OP_CHECKMULTISIG]);
        assert_eq!(sigop_count(&multisig, true), 1);
        assert_eq!(sigop_count(&multisig, false), 20);
        assert_eq!(sigop_count(&[OP_CHECKSIG, OP_CHECKSIGVERIFY], false), 2);
    }

    #[test]
    fn test_push_only() {
        assert!(is_push_only(&[OP_1, OP_0, 2, 0xaa, 0xbb]));
        assert!(!is_push_only(&[OP_1, OP_DUP]));
        assert!(!is_push_only(&[OP_PUSHDATA1]));
    }
}
