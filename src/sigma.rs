use std::fmt;

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::Field;
use k256::{AffinePoint, FieldBytes, ProjectivePoint, Scalar, SecretKey, U256};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::SigmaError;

/// Public data a verifier registers before any challenge is issued.
/// Coordinates are 0x-prefixed 32-byte big-endian hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentSet {
    pub commitments_x: Vec<String>,
    pub commitments_y: Vec<String>,
    pub pk_x: String,
    pub pk_y: String,
}

/// Schnorr identification prover over secp256k1 with one pre-committed
/// nonce per round. Each nonce answers at most one challenge.
pub struct SigmaProver {
    sk: Scalar,
    pk: AffinePoint,
    nonces: Vec<Scalar>,
    commitments: Vec<AffinePoint>,
    current_round: usize,
    answered: Option<([u8; 32], [u8; 32])>,
}

impl fmt::Debug for SigmaProver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigmaProver")
            .field("total_rounds", &self.nonces.len())
            .field("current_round", &self.current_round)
            .field("answered", &self.answered.is_some())
            .finish()
    }
}

impl SigmaProver {
    /// Load the long-term key and draw `rounds` fresh nonces.
    pub fn from_hex(sk_hex: &str, rounds: usize) -> Result<Self, SigmaError> {
        let bytes = hex::decode(sk_hex.trim_start_matches("0x"))
            .map_err(|e| SigmaError::InvalidKey(e.to_string()))?;
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| SigmaError::InvalidKey(e.to_string()))?;
        let nonces = (0..rounds).map(|_| Scalar::random(&mut OsRng)).collect();
        Self::with_nonces(*secret.to_nonzero_scalar(), nonces)
    }

    pub fn with_nonces(sk: Scalar, nonces: Vec<Scalar>) -> Result<Self, SigmaError> {
        if nonces.is_empty() {
            return Err(SigmaError::NoRounds);
        }
        let pk = (ProjectivePoint::GENERATOR * sk).to_affine();
        let commitments = nonces
            .iter()
            .map(|k| (ProjectivePoint::GENERATOR * k).to_affine())
            .collect();
        Ok(Self {
            sk,
            pk,
            nonces,
            commitments,
            current_round: 0,
            answered: None,
        })
    }

    pub fn total_rounds(&self) -> usize {
        self.nonces.len()
    }

    pub fn current_round(&self) -> usize {
        self.current_round
    }

    pub fn public_key(&self) -> AffinePoint {
        self.pk
    }

    pub fn commitment(&self, round: usize) -> Option<AffinePoint> {
        self.commitments.get(round).copied()
    }

    /// `s = (sk * c + k_r) mod n` for the current round. A repeated call with
    /// the same challenge returns the same response; a different challenge in
    /// the same round is refused, since two answers under one nonce reveal `sk`.
    pub fn get_response(&mut self, challenge: &[u8; 32]) -> Result<[u8; 32], SigmaError> {
        if let Some((answered, response)) = &self.answered {
            if answered == challenge {
                return Ok(*response);
            }
            return Err(SigmaError::NonceAlreadyUsed(self.current_round));
        }
        let k = self.nonces[self.current_round];
        let c = challenge_scalar(challenge);
        let s = self.sk * c + k;
        let response = scalar_bytes(&s);
        self.answered = Some((*challenge, response));
        Ok(response)
    }

    /// Move to `round`, which must be exactly the next one.
    pub fn update_round(&mut self, round: usize) -> Result<(), SigmaError> {
        if round >= self.total_rounds() {
            return Err(SigmaError::RoundsExhausted(self.total_rounds()));
        }
        if round != self.current_round + 1 {
            return Err(SigmaError::RoundOutOfOrder {
                current: self.current_round,
                requested: round,
            });
        }
        self.current_round = round;
        self.answered = None;
        Ok(())
    }

    pub fn commitments(&self) -> Result<CommitmentSet, SigmaError> {
        let mut commitments_x = Vec::with_capacity(self.commitments.len());
        let mut commitments_y = Vec::with_capacity(self.commitments.len());
        for c in &self.commitments {
            let (x, y) = affine_coordinates(c)?;
            commitments_x.push(x);
            commitments_y.push(y);
        }
        let (pk_x, pk_y) = affine_coordinates(&self.pk)?;
        Ok(CommitmentSet {
            commitments_x,
            commitments_y,
            pk_x,
            pk_y,
        })
    }
}

/// Challenge hash read as a big-endian integer, reduced mod n.
pub fn challenge_scalar(challenge: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::clone_from_slice(challenge))
}

fn scalar_bytes(s: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&s.to_bytes());
    out
}

fn affine_coordinates(point: &AffinePoint) -> Result<(String, String), SigmaError> {
    let encoded = point.to_encoded_point(false);
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => Ok((
            format!("0x{}", hex::encode(x)),
            format!("0x{}", hex::encode(y)),
        )),
        _ => Err(SigmaError::PointAtInfinity),
    }
}

/// Verifier check `s*G == C + c*pk`.
pub fn verify_response(
    pk: &AffinePoint,
    commitment: &AffinePoint,
    challenge: &[u8; 32],
    response: &[u8; 32],
) -> bool {
    let s = challenge_scalar(response);
    if scalar_bytes(&s) != *response {
        // Non-canonical (>= n) responses are rejected outright.
        return false;
    }
    let c = challenge_scalar(challenge);
    let lhs = ProjectivePoint::GENERATOR * s;
    let rhs = ProjectivePoint::from(*commitment) + ProjectivePoint::from(*pk) * c;
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(n: u8) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[31] = n;
        out
    }

    fn prover(sk: u64, nonces: &[u64]) -> SigmaProver {
        SigmaProver::with_nonces(
            Scalar::from(sk),
            nonces.iter().map(|k| Scalar::from(*k)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn response_is_sk_times_c_plus_k() {
        let mut p = prover(3, &[2, 5]);
        // 3 * 10 + 2 = 32
        assert_eq!(p.get_response(&small(10)).unwrap(), small(32));
    }

    #[test]
    fn response_wraps_modulo_group_order() {
        let mut p = prover(3, &[2]);
        // c = n - 1, so 3c + 2 = -3 + 2 = n - 1
        let n_minus_1 =
            hex::decode("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364140").unwrap();
        let c: [u8; 32] = n_minus_1.clone().try_into().unwrap();
        assert_eq!(p.get_response(&c).unwrap().to_vec(), n_minus_1);
    }

    #[test]
    fn second_challenge_in_same_round_is_refused() {
        let mut p = prover(7, &[11, 13]);
        let first = p.get_response(&small(1)).unwrap();
        assert_eq!(p.get_response(&small(1)).unwrap(), first);
        assert_eq!(
            p.get_response(&small(2)),
            Err(SigmaError::NonceAlreadyUsed(0))
        );

        p.update_round(1).unwrap();
        // 7 * 2 + 13 = 27
        assert_eq!(p.get_response(&small(2)).unwrap(), small(27));
    }

    #[test]
    fn rounds_advance_strictly_in_order() {
        let mut p = prover(1, &[1, 2, 3]);
        assert_eq!(
            p.update_round(2),
            Err(SigmaError::RoundOutOfOrder { current: 0, requested: 2 })
        );
        p.update_round(1).unwrap();
        p.update_round(2).unwrap();
        assert_eq!(p.update_round(3), Err(SigmaError::RoundsExhausted(3)));
        assert_eq!(p.current_round(), 2);
    }

    #[test]
    fn responses_verify_against_commitments() {
        let mut p = SigmaProver::from_hex(
            "1111111111111111111111111111111111111111111111111111111111111111",
            2,
        )
        .unwrap();
        let challenge = crate::util::sha256(b"challenge");
        let s = p.get_response(&challenge).unwrap();
        let pk = p.public_key();
        assert!(verify_response(&pk, &p.commitment(0).unwrap(), &challenge, &s));
        assert!(!verify_response(&pk, &p.commitment(1).unwrap(), &challenge, &s));
    }

    #[test]
    fn commitment_set_has_one_point_per_round() {
        let p = prover(1, &[1, 2, 3, 4, 5]);
        let set = p.commitments().unwrap();
        assert_eq!(set.commitments_x.len(), 5);
        assert_eq!(set.commitments_y.len(), 5);
        // k = 1 commits to the generator itself.
        assert_eq!(
            set.commitments_x[0],
            "0x79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );
        assert_eq!(set.pk_x, set.commitments_x[0]);
        assert_eq!(set.pk_x.len(), 66);
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(matches!(
            SigmaProver::from_hex("00", 1),
            Err(SigmaError::InvalidKey(_))
        ));
        assert!(matches!(
            SigmaProver::from_hex("not hex", 1),
            Err(SigmaError::InvalidKey(_))
        ));
        assert_eq!(
            SigmaProver::with_nonces(Scalar::ONE, vec![]).unwrap_err(),
            SigmaError::NoRounds
        );
    }
}
