use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::types::UpstreamTemplate;
use crate::util::{serialize_number, serialize_string, var_int};

/// Bytes at the start of coinbase part 1 reserved for the Sigma response.
pub const RESPONSE_SLOT_LEN: usize = 32;

const TX_COMMENT: &[u8] = b"/sigma-pool/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RewardType {
    Pow,
    Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub script: Vec<u8>,
    /// Share of the block reward, 0.0..=1.0.
    pub fraction: f64,
}

/// Coinbase split around the extranonce slot: `part0 | en1 | en2 | part1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTransaction {
    pub part0: Vec<u8>,
    pub part1: Vec<u8>,
}

pub struct CoinbaseParams<'a> {
    pub pool_script: &'a [u8],
    pub extranonce_placeholder_len: usize,
    pub reward: RewardType,
    pub tx_messages: bool,
    pub recipients: &'a [Recipient],
}

pub fn create_generation(
    template: &UpstreamTemplate,
    params: &CoinbaseParams<'_>,
) -> PoolResult<GenerationTransaction> {
    let tx_version: u32 = if params.tx_messages { 2 } else { 1 };
    let flags = match &template.coinbaseaux {
        Some(aux) => hex::decode(&aux.flags)?,
        None => Vec::new(),
    };

    let placeholder_len = u8::try_from(params.extranonce_placeholder_len)
        .map_err(|_| PoolError::Template("extranonce placeholder too long".into()))?;

    // The time push uses curtime so a rebuild for the same template is
    // byte-identical.
    let mut script_sig_part1 = serialize_number(template.height);
    script_sig_part1.extend_from_slice(&flags);
    script_sig_part1.extend(serialize_number(template.curtime as u64));
    script_sig_part1.push(placeholder_len);

    let script_sig_len =
        script_sig_part1.len() + params.extranonce_placeholder_len + RESPONSE_SLOT_LEN;

    let mut part0 = Vec::with_capacity(64 + script_sig_part1.len());
    part0.extend_from_slice(&tx_version.to_le_bytes());
    if params.reward == RewardType::Pos {
        part0.extend_from_slice(&template.curtime.to_le_bytes());
    }
    part0.extend(var_int(1));
    part0.extend_from_slice(&[0u8; 32]);
    part0.extend_from_slice(&u32::MAX.to_le_bytes());
    part0.extend(var_int(script_sig_len as u64));
    part0.extend(script_sig_part1);

    let mut part1 = vec![0u8; RESPONSE_SLOT_LEN];
    part1.extend_from_slice(&0u32.to_le_bytes()); // sequence
    part1.extend(output_transactions(template, params)?);
    part1.extend_from_slice(&0u32.to_le_bytes()); // lock time
    if params.tx_messages {
        part1.extend(serialize_string(TX_COMMENT));
    }

    Ok(GenerationTransaction { part0, part1 })
}

fn push_output(out: &mut Vec<u8>, value: u64, script: &[u8]) {
    out.extend_from_slice(&value.to_le_bytes());
    out.extend(var_int(script.len() as u64));
    out.extend_from_slice(script);
}

fn output_transactions(template: &UpstreamTemplate, params: &CoinbaseParams<'_>) -> PoolResult<Vec<u8>> {
    let reward = template.coinbase_value;
    let mut reward_to_pool = reward;
    let mut outputs = Vec::new();
    let mut count = 0u64;

    if let Some(commitment) = &template.default_witness_commitment {
        push_output(&mut outputs, 0, &hex::decode(commitment)?);
        count += 1;
    }

    let mut recipient_outputs = Vec::new();
    for recipient in params.recipients {
        let recipient_reward = (recipient.fraction * reward as f64).floor() as u64;
        reward_to_pool = reward_to_pool.saturating_sub(recipient_reward);
        push_output(&mut recipient_outputs, recipient_reward, &recipient.script);
        count += 1;
    }

    push_output(&mut outputs, reward_to_pool, params.pool_script);
    count += 1;
    outputs.extend(recipient_outputs);

    let mut out = var_int(count);
    out.extend(outputs);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoinbaseAux;

    fn template() -> UpstreamTemplate {
        UpstreamTemplate {
            version: 0x2000_0000,
            previous_block_hash: "00".repeat(32),
            bits: "1d00ffff".into(),
            curtime: 0x6337_8143,
            height: 467,
            coinbase_value: 5_000_000_000,
            transactions: vec![],
            target: None,
            coinbaseaux: Some(CoinbaseAux { flags: String::new() }),
            default_witness_commitment: None,
        }
    }

    fn params<'a>(script: &'a [u8], recipients: &'a [Recipient]) -> CoinbaseParams<'a> {
        CoinbaseParams {
            pool_script: script,
            extranonce_placeholder_len: 5,
            reward: RewardType::Pow,
            tx_messages: false,
            recipients,
        }
    }

    #[test]
    fn part0_ends_with_height_time_and_placeholder_push() {
        let script = [0x51u8];
        let tx = create_generation(&template(), &params(&script, &[])).unwrap();
        let hex0 = hex::encode(&tx.part0);
        assert!(hex0.starts_with("01000000010000000000"));
        assert!(hex0.ends_with("02d301044381376305"), "{}", hex0);
        // 9 bytes of scriptSig prefix + 5 extranonce + 32 response slot
        assert!(hex0.ends_with("ffffffff2e02d301044381376305"));
    }

    #[test]
    fn part1_starts_with_response_slot() {
        let script = [0x51u8];
        let tx = create_generation(&template(), &params(&script, &[])).unwrap();
        assert_eq!(&tx.part1[..RESPONSE_SLOT_LEN], &[0u8; RESPONSE_SLOT_LEN]);
        assert_eq!(&tx.part1[RESPONSE_SLOT_LEN..RESPONSE_SLOT_LEN + 4], &[0, 0, 0, 0]);
        // one output: 5000000000 sat to a 1-byte script
        assert_eq!(tx.part1[36], 1);
        assert_eq!(&tx.part1[37..45], &5_000_000_000u64.to_le_bytes());
    }

    #[test]
    fn recipients_and_witness_commitment() {
        let mut t = template();
        t.default_witness_commitment = Some("6a24aa21a9ed".into());
        let recipients = vec![Recipient { script: vec![0x52], fraction: 0.01 }];
        let script = [0x51u8];
        let tx = create_generation(&t, &params(&script, &recipients)).unwrap();

        let outs = &tx.part1[36..];
        assert_eq!(outs[0], 3);
        // witness commitment first, zero value
        assert_eq!(&outs[1..9], &[0u8; 8]);
        let pool_value_at = 1 + 8 + 1 + 6;
        assert_eq!(
            &outs[pool_value_at..pool_value_at + 8],
            &4_950_000_000u64.to_le_bytes()
        );
    }

    #[test]
    fn pos_and_tx_messages_extend_the_transaction() {
        let script = [0x51u8];
        let mut p = params(&script, &[]);
        p.reward = RewardType::Pos;
        p.tx_messages = true;
        let tx = create_generation(&template(), &p).unwrap();
        assert_eq!(&tx.part0[..4], &2u32.to_le_bytes());
        assert_eq!(&tx.part0[4..8], &0x6337_8143u32.to_le_bytes());
        assert!(tx.part1.ends_with(&serialize_string(TX_COMMENT)));
    }

    #[test]
    fn rebuild_is_deterministic() {
        let script = [0x51u8];
        let a = create_generation(&template(), &params(&script, &[])).unwrap();
        let b = create_generation(&template(), &params(&script, &[])).unwrap();
        assert_eq!(a, b);
    }
}
