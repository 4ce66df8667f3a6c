/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod common;

use common::*;
use hsm_driver::{
    AeadContext, AeadMode, CryptoKey, DriverConfig, EddsaContext, HsmError, MacContext, MacMode,
    OperationKind, ReturnBehavior,
};
use rstest::rstest;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;

fn mac_key() -> CryptoKey {
    CryptoKey::plaintext(&pattern(16))
}

#[tokio::test]
async fn test_lock_timeout() {
    let config = DriverConfig::default().with_lock_timeout(Some(Duration::from_millis(20)));
    let bench = bench(config).await;
    let ctx = MacContext::new(&bench.hsm, MacMode::Cmac);

    let held = bench.hsm.lock().await.unwrap();
    assert!(bench.hsm.is_locked());
    let res = ctx.sign(&mac_key(), b"abc", 16).await;
    assert_eq!(res, Err(HsmError::ResourceUnavailable));
    assert!(matches!(
        bench.hsm.lock_with_timeout(Some(Duration::ZERO)).await,
        Err(HsmError::ResourceUnavailable)
    ));
    // Nothing was set up, so the context is still free.
    assert!(ctx.is_idle().await);

    drop(held);
    assert!(ctx.sign(&mac_key(), b"abc", 16).await.is_ok());
    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_lock_is_shared_between_contexts() {
    let bench = default_bench().await;
    let mut tasks = Vec::new();
    for i in 0..8usize {
        let hsm = bench.hsm.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = MacContext::new(&hsm, MacMode::Cmac);
            ctx.sign(&mac_key(), &pattern(100 * i + 1), 16)
                .await
                .map(|c| c.done().unwrap())
        }));
    }

    let reference = MacContext::new(&bench.hsm, MacMode::Cmac);
    for (i, task) in tasks.into_iter().enumerate() {
        let mac = task.await.unwrap().unwrap();
        let msg = pattern(100 * i + 1);
        let expected = reference.sign(&mac_key(), &msg, 16).await.unwrap();
        assert_eq!(expected.done().unwrap(), mac);
    }
    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_callback_delivery() {
    let bench = default_bench().await;
    let (callback, mut rx) = channel_callback();
    let msg = pattern(500);

    let blocking = MacContext::new(&bench.hsm, MacMode::Cmac);
    let expected = blocking
        .sign(&mac_key(), &msg, 16)
        .await
        .unwrap()
        .done()
        .unwrap();

    let mac = MacContext::new(&bench.hsm, MacMode::Cmac).with_callback(callback.clone());
    assert!(mac.sign(&mac_key(), &msg, 16).await.unwrap().is_pending());
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacSign);
    assert_eq!(res, Ok(expected.clone()));

    let pending = mac.verify(&mac_key(), &msg, &expected).await.unwrap();
    assert!(pending.is_pending());
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacVerify);
    assert_eq!(res, Ok(Vec::new()));

    // Failures found after the call was accepted also go to the callback.
    let mut wrong = expected.clone();
    wrong[0] ^= 1;
    let pending = mac.verify(&mac_key(), &msg, &wrong).await.unwrap();
    assert!(pending.is_pending());
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacVerify);
    assert_eq!(res, Err(HsmError::MacInvalid));

    let aead = AeadContext::new(&bench.hsm, AeadMode::Gcm).with_callback(callback.clone());
    let nonce = pattern(12);
    let pending = aead
        .encrypt(&mac_key(), &nonce, b"", &msg, 16)
        .await
        .unwrap();
    assert!(pending.is_pending());
    let (kind, sealed) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::AeadEncrypt);
    assert_eq!(sealed.unwrap().len(), msg.len() + 16);

    let eddsa = EddsaContext::new(&bench.hsm).with_callback(callback);
    let seed = CryptoKey::plaintext(&[7u8; 32]);
    assert!(eddsa.sign(&seed, &msg).await.unwrap().is_pending());
    let (kind, sig) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::Sign);
    assert_eq!(sig.unwrap().len(), 64);

    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_rejected_calls_skip_the_callback() {
    let bench = default_bench().await;
    let (callback, mut rx) = channel_callback();
    let ctx = MacContext::new(&bench.hsm, MacMode::Cmac).with_callback(callback);

    let res = ctx.sign(&mac_key(), b"abc", 0).await;
    assert!(matches!(res, Err(HsmError::InvalidArgument(_))));
    assert!(matches!(ctx.update(b"abc").await, Err(HsmError::BadState(_))));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_callback_behavior_needs_callback() {
    let bench = default_bench().await;
    let mut ctx = MacContext::new(&bench.hsm, MacMode::Cmac);
    assert!(matches!(
        ctx.set_return_behavior(ReturnBehavior::Callback),
        Err(HsmError::InvalidArgument(_))
    ));
    ctx.set_return_behavior(ReturnBehavior::Polling).unwrap();
    let mac = ctx.sign(&mac_key(), b"abc", 16).await.unwrap();
    assert!(mac.done().is_some());
}

#[tokio::test]
async fn test_callback_default_without_callback_blocks() {
    let config = DriverConfig::default().with_return_behavior(ReturnBehavior::Callback);
    let bench = bench(config).await;
    let ctx = MacContext::new(&bench.hsm, MacMode::Cmac);

    let mac = ctx.sign(&mac_key(), b"abc", 16).await.unwrap();
    assert_eq!(mac.done().map(|m| m.len()), Some(16));

    let (callback, mut rx) = channel_callback();
    let ctx = ctx.with_callback(callback);
    assert!(ctx.sign(&mac_key(), b"abc", 16).await.unwrap().is_pending());
    let (kind, mac) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacSign);
    assert_eq!(mac.unwrap().len(), 16);
    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_cancel_before_data_is_silent() {
    let bench = default_bench().await;
    let (callback, mut rx) = channel_callback();

    let mac = MacContext::new(&bench.hsm, MacMode::Cmac).with_callback(callback.clone());
    mac.cancel().await.unwrap();
    mac.sign_setup(&mac_key()).await.unwrap();
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacSetup);
    assert_eq!(res, Ok(Vec::new()));
    mac.cancel().await.unwrap();
    assert!(mac.is_idle().await);

    let aead = AeadContext::new(&bench.hsm, AeadMode::Ccm).with_callback(callback);
    aead.encrypt_setup(&mac_key()).await.unwrap();
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::AeadSetup);
    assert_eq!(res, Ok(Vec::new()));
    aead.set_lengths(4, 4, 8).await.unwrap();
    aead.set_nonce(&pattern(13)).await.unwrap();
    aead.cancel().await.unwrap();
    assert!(aead.is_idle().await);

    tokio::task::yield_now().await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_cancel_after_data_reports_cancelled() {
    let bench = default_bench().await;
    let (callback, mut rx) = channel_callback();

    let mac = MacContext::new(&bench.hsm, MacMode::Cmac).with_callback(callback.clone());
    mac.verify_setup(&mac_key()).await.unwrap();
    mac.update(&pattern(100)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().0, OperationKind::MacSetup);
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacUpdate);
    assert_eq!(res, Ok(Vec::new()));
    mac.cancel().await.unwrap();
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacUpdate);
    assert_eq!(res, Err(HsmError::Cancelled));

    let aead = AeadContext::new(&bench.hsm, AeadMode::Gcm).with_callback(callback);
    aead.decrypt_setup(&mac_key()).await.unwrap();
    aead.set_lengths(40, 40, 16).await.unwrap();
    aead.set_nonce(&pattern(12)).await.unwrap();
    aead.update_aad(&pattern(40)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().0, OperationKind::AeadSetup);
    assert_eq!(rx.recv().await.unwrap().0, OperationKind::AeadUpdate);
    aead.cancel().await.unwrap();
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::AeadUpdate);
    assert_eq!(res, Err(HsmError::Cancelled));

    assert!(mac.is_idle().await && aead.is_idle().await);
    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_cancel_during_sequence() {
    let bench = bench(DriverConfig::default().with_max_transfer_len(1024)).await;
    bench.sim.set_latency(Duration::from_millis(5)).await;
    let (callback, mut rx) = channel_callback();
    let long = pattern(20_000);

    let mac = MacContext::new(&bench.hsm, MacMode::Cmac).with_callback(callback.clone());
    assert!(mac.sign(&mac_key(), &long, 16).await.unwrap().is_pending());
    tokio::time::sleep(Duration::from_millis(30)).await;
    mac.cancel().await.unwrap();
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::MacSign);
    assert_eq!(res, Err(HsmError::Cancelled));
    assert!(mac.is_idle().await);
    bench.assert_balanced().await;

    let eddsa = EddsaContext::new(&bench.hsm).with_callback(callback);
    let seed = CryptoKey::plaintext(&[3u8; 32]);
    assert!(eddsa.sign(&seed, &long).await.unwrap().is_pending());
    tokio::time::sleep(Duration::from_millis(60)).await;
    eddsa.cancel().await.unwrap();
    let (kind, res) = rx.recv().await.unwrap();
    assert_eq!(kind, OperationKind::Sign);
    assert_eq!(res, Err(HsmError::Cancelled));
    assert!(eddsa.is_idle().await);

    let stats = bench.stats().await;
    assert!(stats.created > 0);
    bench.assert_balanced().await;

    // Cancellation does not stick to the context.
    bench.sim.set_latency(Duration::ZERO).await;
    let again = mac.sign(&mac_key(), b"again", 16).await.unwrap();
    assert!(again.is_pending());
    assert!(rx.recv().await.unwrap().1.is_ok());
}

#[rstest]
#[case(ReturnBehavior::Blocking)]
#[case(ReturnBehavior::Polling)]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn test_result_timeout(#[case] behavior: ReturnBehavior) {
    let config = DriverConfig::default()
        .with_return_behavior(behavior)
        .with_result_timeout(Duration::from_millis(50));
    let bench = bench(config).await;
    let ctx = MacContext::new(&bench.hsm, MacMode::Cmac);

    bench.sim.set_latency(Duration::from_millis(200)).await;
    let res = ctx.sign(&mac_key(), b"slow", 16).await;
    assert_eq!(res, Err(HsmError::Timeout));
    assert!(ctx.is_idle().await);
    assert!(!bench.hsm.is_locked());

    // The late result is consumed before the next token goes out.
    bench.sim.set_latency(Duration::ZERO).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(ctx.sign(&mac_key(), b"fast", 16).await.is_ok());
}

#[rstest]
#[case(ReturnBehavior::Blocking)]
#[case(ReturnBehavior::Polling)]
#[tokio::test]
async fn test_behaviors_agree(#[case] behavior: ReturnBehavior) {
    let bench = bench(DriverConfig::default().with_return_behavior(behavior)).await;
    let key = mac_key();
    let (nonce, msg) = (pattern(12), pattern(6000));

    let mac = MacContext::new(&bench.hsm, MacMode::Cmac);
    let tag = mac.sign(&key, &msg, 16).await.unwrap().done().unwrap();
    mac.verify(&key, &msg, &tag).await.unwrap();

    let aead = AeadContext::new(&bench.hsm, AeadMode::Ccm);
    let sealed = aead
        .encrypt(&key, &nonce, b"hdr", &msg, 12)
        .await
        .unwrap()
        .done()
        .unwrap();
    let opened = aead
        .decrypt(&key, &nonce, b"hdr", &sealed.ciphertext, &sealed.tag)
        .await
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(opened, msg);

    let eddsa = EddsaContext::new(&bench.hsm);
    let seed = CryptoKey::plaintext(&[9u8; 32]);
    let public = eddsa
        .generate_public_key(&seed)
        .await
        .unwrap()
        .done()
        .unwrap();
    let sig = eddsa.sign(&seed, &msg).await.unwrap().done().unwrap();
    eddsa.verify(&public, &msg, &sig).await.unwrap();

    bench.assert_balanced().await;
}

#[tokio::test]
async fn test_shutdown_unlinks() {
    let bench = default_bench().await;
    let ctx = MacContext::new(&bench.hsm, MacMode::Cmac);
    bench.hsm.shutdown().await.unwrap();

    let res = ctx.sign(&mac_key(), b"abc", 16).await;
    assert!(matches!(res, Err(HsmError::ResourceError(_))));
}

#[tokio::test]
async fn test_asset_store_exhaustion() {
    init_logger();
    let sim = hsm_driver::SimEngine::with_limits(1, DriverConfig::default().max_transfer_len);
    let hsm = hsm_driver::Hsm::init(Box::new(sim.mailbox()), DriverConfig::default())
        .await
        .unwrap();
    let ctx = EddsaContext::new(&hsm);

    let key = CryptoKey::plaintext(&[1u8; 32]);
    let res = ctx.sign(&key, b"needs four assets").await;
    assert!(matches!(res, Err(HsmError::ResourceError(_))));
    let stats = sim.stats().await;
    assert_eq!(stats.created, stats.freed);
}
