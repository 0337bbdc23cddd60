//! Ledger integration tests: transfer semantics, redemption uniqueness,
//! expiry handling, and the gateway-mirror conservation invariant.

use chrono::{Duration, Utc};

use tally_common::{truncate_to_seconds, TallyError, UserId};
use tally_gateway::memory::Fault;
use tally_integration_tests::common::{expiry_in_days, giver, test_codec, LedgerFixture};
use tally_ledger::{
    AuditOperation, QuotaLedger, TransferInStatus, TransferItem, TransferOutRequest, VoucherData,
};

#[tokio::test]
async fn test_transfer_roundtrip_preserves_expiries() {
    // Giver holds {50, T+15d} and {70, T+45d}; both move to the receiver
    // and the audit rows carry the earliest expiry.
    let fixture = LedgerFixture::new();
    let giver_id = UserId::new();
    let receiver_id = UserId::new();
    let near = expiry_in_days(15);
    let far = expiry_in_days(45);

    fixture
        .seed_records(
            giver_id,
            &[TransferItem::new(50, near), TransferItem::new(70, far)],
        )
        .await;

    let receipt = fixture
        .ledger
        .transfer_out(
            &giver(giver_id),
            &TransferOutRequest {
                receiver_id: Some(receiver_id),
                items: vec![TransferItem::new(50, near), TransferItem::new(70, far)],
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.amount, 120);
    assert_eq!(receipt.earliest_expiry, near);
    assert_eq!(fixture.gateway.total(giver_id), 0);

    let outcome = fixture
        .ledger
        .transfer_in(receiver_id, &receipt.voucher_code)
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferInStatus::Success);
    assert_eq!(outcome.amount, 120);
    assert_eq!(fixture.gateway.total(receiver_id), 120);

    // Receiver ends with the two original expiries.
    let quota = fixture.ledger.get_user_quota(receiver_id).await.unwrap();
    assert_eq!(quota.records.len(), 2);
    assert_eq!(quota.records[0], TransferItem::new(50, near));
    assert_eq!(quota.records[1], TransferItem::new(70, far));

    // TRANSFER_OUT and TRANSFER_IN audit expiries both equal the
    // earliest transferred expiry.
    let giver_audits = fixture.ledger.audit_for_user(giver_id, 10).await.unwrap();
    let out_row = giver_audits
        .iter()
        .find(|a| a.operation == AuditOperation::TransferOut)
        .unwrap();
    assert_eq!(out_row.expiry_date, near);
    assert_eq!(out_row.amount, -120);

    let receiver_audits = fixture.ledger.audit_for_user(receiver_id, 10).await.unwrap();
    let in_row = receiver_audits
        .iter()
        .find(|a| a.operation == AuditOperation::TransferIn)
        .unwrap();
    assert_eq!(in_row.expiry_date, near);
    assert_eq!(in_row.amount, 120);
}

#[tokio::test]
async fn test_transfer_out_is_all_or_nothing() {
    // One satisfiable item plus one oversized item: nothing changes.
    let fixture = LedgerFixture::new();
    let giver_id = UserId::new();
    let near = expiry_in_days(10);
    let far = expiry_in_days(30);
    fixture
        .seed_records(
            giver_id,
            &[TransferItem::new(100, near), TransferItem::new(100, far)],
        )
        .await;

    let err = fixture
        .ledger
        .transfer_out(
            &giver(giver_id),
            &TransferOutRequest {
                receiver_id: Some(UserId::new()),
                items: vec![TransferItem::new(60, near), TransferItem::new(500, far)],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::InsufficientQuota { .. }));

    let quota = fixture.ledger.get_user_quota(giver_id).await.unwrap();
    assert_eq!(quota.total_quota, 200);
    assert_eq!(quota.records[0].amount, 100);
    assert_eq!(quota.records[1].amount, 100);
    // No TRANSFER_OUT audit row was written.
    let audits = fixture.ledger.audit_for_user(giver_id, 10).await.unwrap();
    assert!(audits
        .iter()
        .all(|a| a.operation != AuditOperation::TransferOut));
}

#[tokio::test]
async fn test_transfer_out_gateway_failure_rolls_back() {
    let fixture = LedgerFixture::new();
    let giver_id = UserId::new();
    let near = expiry_in_days(10);
    fixture
        .seed_records(giver_id, &[TransferItem::new(100, near)])
        .await;

    // The first gateway call of transfer_out is the usage query.
    fixture.gateway.inject_fault(Fault::Transient);
    let err = fixture
        .ledger
        .transfer_out(
            &giver(giver_id),
            &TransferOutRequest {
                receiver_id: Some(UserId::new()),
                items: vec![TransferItem::new(40, near)],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::GatewayTransient(_)));

    let quota = fixture.ledger.get_user_quota(giver_id).await.unwrap();
    assert_eq!(quota.total_quota, 100);
    assert_eq!(fixture.gateway.total(giver_id), 100);
}

#[tokio::test]
async fn test_redemption_is_at_most_once() {
    let fixture = LedgerFixture::new();
    let giver_id = UserId::new();
    let receiver_id = UserId::new();
    let near = expiry_in_days(10);
    fixture
        .seed_records(giver_id, &[TransferItem::new(100, near)])
        .await;

    let receipt = fixture
        .ledger
        .transfer_out(
            &giver(giver_id),
            &TransferOutRequest {
                receiver_id: Some(receiver_id),
                items: vec![TransferItem::new(100, near)],
            },
        )
        .await
        .unwrap();

    let first = fixture
        .ledger
        .transfer_in(receiver_id, &receipt.voucher_code)
        .await
        .unwrap();
    assert_eq!(first.status, TransferInStatus::Success);

    let second = fixture
        .ledger
        .transfer_in(receiver_id, &receipt.voucher_code)
        .await
        .unwrap();
    assert_eq!(second.status, TransferInStatus::AlreadyRedeemed);
    assert_eq!(fixture.gateway.total(receiver_id), 100);

    // Exactly one successful TRANSFER_IN audit row references the code.
    let audits = fixture.ledger.audit_for_user(receiver_id, 10).await.unwrap();
    let referencing = audits
        .iter()
        .filter(|a| {
            a.operation == AuditOperation::TransferIn
                && a.voucher_code.as_deref() == Some(receipt.voucher_code.as_str())
        })
        .count();
    assert_eq!(referencing, 1);

    let redemption = fixture
        .ledger
        .find_redemption(&receipt.voucher_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redemption.user_id, receiver_id);
    assert_eq!(redemption.amount, 100);
}

#[tokio::test]
async fn test_partially_expired_voucher() {
    // One item expired twelve hours ago, one lives for thirty days.
    let fixture = LedgerFixture::new();
    let receiver_id = UserId::new();
    let expired = truncate_to_seconds(Utc::now() - Duration::hours(12));
    let live = expiry_in_days(30);

    let voucher = test_codec()
        .encode(&VoucherData {
            giver_id: UserId::new(),
            giver_name: "g".to_string(),
            giver_phone: String::new(),
            giver_github: String::new(),
            receiver_id,
            items: vec![TransferItem::new(40, expired), TransferItem::new(60, live)],
        })
        .unwrap();

    let outcome = fixture
        .ledger
        .transfer_in(receiver_id, &voucher)
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferInStatus::PartialSuccess);
    assert!(outcome.message.contains("expired"));
    assert_eq!(outcome.amount, 60);

    let quota = fixture.ledger.get_user_quota(receiver_id).await.unwrap();
    assert_eq!(quota.records, vec![TransferItem::new(60, live)]);

    // The audit expiry is the earliest CREDITED expiry.
    let audits = fixture.ledger.audit_for_user(receiver_id, 10).await.unwrap();
    assert_eq!(audits[0].expiry_date, live);
}

#[tokio::test]
async fn test_fully_expired_voucher_fails() {
    let fixture = LedgerFixture::new();
    let receiver_id = UserId::new();
    let voucher = test_codec()
        .encode(&VoucherData {
            giver_id: UserId::new(),
            giver_name: "g".to_string(),
            giver_phone: String::new(),
            giver_github: String::new(),
            receiver_id,
            items: vec![TransferItem::new(
                40,
                truncate_to_seconds(Utc::now() - Duration::hours(1)),
            )],
        })
        .unwrap();

    let outcome = fixture
        .ledger
        .transfer_in(receiver_id, &voucher)
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferInStatus::Failed);
    assert!(outcome.message.contains("expired"));
    assert_eq!(fixture.gateway.total(receiver_id), 0);
}

#[tokio::test]
async fn test_receiver_mismatch_is_failed_status() {
    let fixture = LedgerFixture::new();
    let voucher = test_codec()
        .encode(&VoucherData {
            giver_id: UserId::new(),
            giver_name: "g".to_string(),
            giver_phone: String::new(),
            giver_github: String::new(),
            receiver_id: UserId::new(),
            items: vec![TransferItem::new(40, expiry_in_days(5))],
        })
        .unwrap();

    // Another user presents the voucher: a FAILED outcome, not an error.
    let outcome = fixture
        .ledger
        .transfer_in(UserId::new(), &voucher)
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferInStatus::Failed);

    let garbage = fixture
        .ledger
        .transfer_in(UserId::new(), "not-a-voucher")
        .await
        .unwrap();
    assert_eq!(garbage.status, TransferInStatus::Failed);
    assert!(garbage.message.contains("invalid"));
}

#[tokio::test]
async fn test_merge_into_existing_record_on_transfer_in() {
    // Receiver already holds a record at the same expiry: amounts merge
    // instead of creating a second record.
    let fixture = LedgerFixture::new();
    let receiver_id = UserId::new();
    let shared = expiry_in_days(20);
    fixture
        .seed_records(receiver_id, &[TransferItem::new(30, shared)])
        .await;
    fixture
        .seed_records(receiver_id, &[TransferItem::new(45, shared)])
        .await;

    let quota = fixture.ledger.get_user_quota(receiver_id).await.unwrap();
    assert_eq!(quota.records, vec![TransferItem::new(75, shared)]);
}

#[tokio::test]
async fn test_ledger_conservation() {
    // sum(VALID) − recorded CONSUME = gateway total − gateway used,
    // across recharge, consumption, transfer, and expiry.
    let fixture = LedgerFixture::new();
    let user = UserId::new();

    fixture
        .ledger
        .add_quota_for_strategy(user, 300, "seed")
        .await
        .unwrap();
    fixture.ledger.delta_used_quota(user, 120).await.unwrap();

    let receiver = UserId::new();
    let quota = fixture.ledger.get_user_quota(user).await.unwrap();
    let expiry = quota.records[0].expiry_date;
    fixture
        .ledger
        .transfer_out(
            &giver(user),
            &TransferOutRequest {
                receiver_id: Some(receiver),
                items: vec![TransferItem::new(50, expiry)],
            },
        )
        .await
        .unwrap();
    fixture.ledger.expire_quotas().await.unwrap();

    for subject in [user, receiver] {
        let quota = fixture.ledger.get_user_quota(subject).await.unwrap();
        let audits = fixture.ledger.audit_for_user(subject, 100).await.unwrap();
        let consumed: i64 = audits
            .iter()
            .filter(|a| a.operation == AuditOperation::Consume)
            .map(|a| -a.amount)
            .sum();
        assert_eq!(
            quota.total_quota - consumed,
            fixture.gateway.total(subject) - fixture.gateway.used(subject),
            "conservation violated for {subject}"
        );
    }
}

#[tokio::test]
async fn test_consumed_quota_blocks_transfer_of_early_expiry() {
    // Usage allocates to the earliest expiry first, so a heavily
    // consumed user cannot move out the early slice.
    let fixture = LedgerFixture::new();
    let user = UserId::new();
    let near = expiry_in_days(10);
    let far = expiry_in_days(30);
    fixture
        .seed_records(
            user,
            &[TransferItem::new(100, near), TransferItem::new(100, far)],
        )
        .await;
    fixture.ledger.delta_used_quota(user, 120).await.unwrap();

    let err = fixture
        .ledger
        .transfer_out(
            &giver(user),
            &TransferOutRequest {
                receiver_id: Some(UserId::new()),
                items: vec![TransferItem::new(90, near)],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::InsufficientQuota { .. }));

    // The later expiry still has 80 available.
    fixture
        .ledger
        .transfer_out(
            &giver(user),
            &TransferOutRequest {
                receiver_id: Some(UserId::new()),
                items: vec![TransferItem::new(80, far)],
            },
        )
        .await
        .unwrap();
}
