/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Ed25519 phases of the simulated engine.
use crate::connection::command::ResultCode;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::{Scalar, clamp_integer};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

/// Length of one SHA-512 block; intermediate hash chunks must be multiples of it.
pub use crate::crypto::eddsa::HASH_BLOCK;

/// Expanded private key.
pub(crate) struct Expanded {
    pub scalar: Scalar,
    pub prefix: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

pub(crate) fn expand(seed: &[u8]) -> Result<Expanded, ResultCode> {
    if seed.len() != 32 {
        return Err(ResultCode::InvalidKeySize);
    }
    let h = Sha512::digest(seed);
    let mut lower = [0u8; 32];
    lower.copy_from_slice(&h[..32]);
    let scalar = Scalar::from_bytes_mod_order(clamp_integer(lower));
    let mut prefix = Zeroizing::new([0u8; 32]);
    prefix.copy_from_slice(&h[32..]);

    Ok(Expanded {
        scalar,
        prefix,
        public: EdwardsPoint::mul_base(&scalar).compress().to_bytes(),
    })
}

pub(crate) fn decompress(bytes: &[u8]) -> Result<EdwardsPoint, ResultCode> {
    let raw: [u8; 32] = bytes.try_into().map_err(|_| ResultCode::InvalidLength)?;
    CompressedEdwardsY(raw)
        .decompress()
        .ok_or(ResultCode::InvalidAsset)
}

fn wide_scalar(hasher: Sha512) -> Scalar {
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&digest)
}

/// Per-signature secrets, kept in an engine-owned state asset.
pub(crate) struct SignState {
    pub scalar: Scalar,
    pub public: [u8; 32],
    pub nonce: Option<(Scalar, [u8; 32])>,
}

/// Running hash in the temporary asset.
pub(crate) enum HashState {
    /// Hashing `prefix || M` to obtain the signature nonce
    SignNonce(Sha512),
    /// Hashing `R || A || M` for the challenge
    SignChallenge(Sha512),
    /// Hashing `R || A || M` while verifying
    Verify {
        hasher: Sha512,
        public: EdwardsPoint,
        r: [u8; 32],
        s: [u8; 32],
    },
}

impl HashState {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashState::SignNonce(h) | HashState::SignChallenge(h) => h.update(data),
            HashState::Verify { hasher, .. } => hasher.update(data),
        }
    }
}

pub(crate) fn sign_initial(expanded: &Expanded, data: &[u8]) -> (SignState, HashState) {
    let mut hasher = Sha512::new();
    hasher.update(expanded.prefix.as_slice());
    hasher.update(data);
    (
        SignState {
            scalar: expanded.scalar,
            public: expanded.public,
            nonce: None,
        },
        HashState::SignNonce(hasher),
    )
}

/// Closes the nonce hash and re-seeds the running hash with `R || A || head`.
pub(crate) fn sign_update(
    sign: &mut SignState,
    hash: HashState,
    tail: &[u8],
    head: &[u8],
) -> Result<HashState, ResultCode> {
    let HashState::SignNonce(mut hasher) = hash else {
        return Err(ResultCode::InvalidState);
    };
    hasher.update(tail);
    let r = wide_scalar(hasher);
    let big_r = EdwardsPoint::mul_base(&r).compress().to_bytes();
    sign.nonce = Some((r, big_r));

    let mut challenge = Sha512::new();
    challenge.update(big_r);
    challenge.update(sign.public);
    challenge.update(head);
    Ok(HashState::SignChallenge(challenge))
}

pub(crate) fn sign_finalize(
    sign: &SignState,
    hash: HashState,
    tail: &[u8],
) -> Result<Vec<u8>, ResultCode> {
    let HashState::SignChallenge(mut hasher) = hash else {
        return Err(ResultCode::InvalidState);
    };
    let (r, big_r) = sign.nonce.ok_or(ResultCode::InvalidState)?;
    hasher.update(tail);
    let k = wide_scalar(hasher);
    let s = r + k * sign.scalar;

    let mut sig = Vec::with_capacity(64);
    sig.extend_from_slice(&big_r);
    sig.extend_from_slice(s.as_bytes());
    Ok(sig)
}

pub(crate) fn verify_initial(
    public: &[u8],
    signature: &[u8],
    data: &[u8],
) -> Result<HashState, ResultCode> {
    if signature.len() != 64 {
        return Err(ResultCode::InvalidLength);
    }
    let point = decompress(public)?;
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&signature[..32]);
    s.copy_from_slice(&signature[32..]);

    let mut hasher = Sha512::new();
    hasher.update(r);
    hasher.update(public);
    hasher.update(data);
    Ok(HashState::Verify {
        hasher,
        public: point,
        r,
        s,
    })
}

pub(crate) fn verify_finalize(hash: HashState, tail: &[u8]) -> Result<(), ResultCode> {
    let HashState::Verify {
        mut hasher,
        public,
        r,
        s,
    } = hash
    else {
        return Err(ResultCode::InvalidState);
    };
    hasher.update(tail);
    let k = wide_scalar(hasher);

    let s: Option<Scalar> = Scalar::from_canonical_bytes(s).into();
    let s = s.ok_or(ResultCode::VerifyError)?;
    let check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&k, &(-public), &s);
    if check.compress().to_bytes() == r {
        Ok(())
    } else {
        Err(ResultCode::VerifyError)
    }
}
