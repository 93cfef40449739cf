/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs
use chrono::Utc;
use proptest::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use clinic_lead_intake::dedup::{fold_lead_into, resolve, MatchThresholds, Resolution};
use clinic_lead_intake::matching::{normalize_phone, score_candidates, MatchWeights};
use clinic_lead_intake::models::{CanonicalLead, CustomerRecord, FieldData, LeadProvenance};
use clinic_lead_intake::normalizer::normalize;
use clinic_lead_intake::signature::{sign, SignatureAlgorithm, SignatureVerifier};

fn provenance() -> LeadProvenance {
    LeadProvenance {
        provider: "page".to_string(),
        lead_id: "P-1".to_string(),
        form_id: None,
        campaign_id: None,
        adset_id: None,
        ad_id: None,
        created_time: Utc::now(),
    }
}

fn lead(
    first: Option<String>,
    last: Option<String>,
    email: Option<String>,
    phone: Option<String>,
) -> CanonicalLead {
    CanonicalLead {
        first_name: first,
        last_name: last,
        email,
        phone,
        provenance: provenance(),
        raw: Value::Null,
    }
}

fn record(
    first: Option<String>,
    last: Option<String>,
    email: Option<String>,
    phone: Option<String>,
) -> CustomerRecord {
    let now = Utc::now();
    CustomerRecord {
        id: Uuid::new_v4(),
        first_name: first,
        last_name: last,
        email,
        phone,
        version: 1,
        created_at: now,
        updated_at: now,
        lead_refs: Vec::new(),
    }
}

fn opt_word() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-zA-Z]{1,8}")
}

fn opt_phone() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[0-9 ()+-]{3,14}")
}

fn opt_email() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-z]{1,6}@[a-z]{1,6}\\.(com|org)")
}

fn algorithm() -> impl Strategy<Value = SignatureAlgorithm> {
    prop::sample::select(vec![
        SignatureAlgorithm::Sha256,
        SignatureAlgorithm::Sha384,
        SignatureAlgorithm::Sha512,
    ])
}

// Property: signatures verify, and any single-byte change breaks them
proptest! {
    #[test]
    fn signed_payloads_verify(
        payload in prop::collection::vec(any::<u8>(), 0..512),
        secret in "[a-zA-Z0-9]{1,32}",
        alg in algorithm()
    ) {
        let verifier = SignatureVerifier::new(Some(secret.clone()));
        let header = sign(&payload, &secret, alg);
        prop_assert!(verifier.verify(&payload, Some(&header)));
    }

    #[test]
    fn single_byte_mutation_is_rejected(
        payload in prop::collection::vec(any::<u8>(), 1..512),
        secret in "[a-zA-Z0-9]{1,32}",
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255u8,
        alg in algorithm()
    ) {
        let verifier = SignatureVerifier::new(Some(secret.clone()));
        let header = sign(&payload, &secret, alg);

        let mut tampered = payload.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        prop_assert!(!verifier.verify(&tampered, Some(&header)));
    }

    #[test]
    fn garbage_headers_never_panic(header in "\\PC*") {
        let verifier = SignatureVerifier::new(Some("secret".to_string()));
        let _ = verifier.verify(b"payload", Some(&header));
    }
}

// Property: the normalizer is total
proptest! {
    #[test]
    fn unrecognised_fields_yield_empty_lead(
        fields in prop::collection::vec(
            ("x_[a-z]{1,10}", prop::collection::vec("\\PC{0,12}", 0..3)),
            0..8
        )
    ) {
        let fields: Vec<FieldData> = fields
            .into_iter()
            .map(|(name, values)| FieldData { name, values })
            .collect();
        let lead = normalize(&fields, provenance(), Value::Null);
        prop_assert!(lead.is_empty());
    }

    #[test]
    fn normalized_values_are_trimmed(name in "[a-zA-Z]{1,8}", pad in " {0,3}") {
        let fields = vec![FieldData::new("first_name", format!("{}{}{}", pad, name, pad))];
        let lead = normalize(&fields, provenance(), Value::Null);
        prop_assert_eq!(lead.first_name, Some(name));
    }
}

// Property: scoring
proptest! {
    #[test]
    fn confidence_is_capped_and_nonzero(
        lf in opt_word(), ll in opt_word(), le in opt_email(), lp in opt_phone(),
        rf in opt_word(), rl in opt_word(), re in opt_email(), rp in opt_phone()
    ) {
        let lead = lead(lf, ll, le, lp);
        let pool = vec![record(rf, rl, re, rp)];
        for candidate in score_candidates(&lead, &pool, &MatchWeights::default()) {
            prop_assert!(candidate.confidence > 0);
            prop_assert!(candidate.confidence <= 100);
        }
    }

    #[test]
    fn candidates_are_sorted_best_first(
        records in prop::collection::vec((opt_word(), opt_email(), opt_phone()), 0..10),
        last in opt_word(), email in opt_email(), phone in opt_phone()
    ) {
        let lead = lead(None, last, email, phone);
        let pool: Vec<CustomerRecord> = records
            .into_iter()
            .map(|(l, e, p)| record(None, l, e, p))
            .collect();
        let scored = score_candidates(&lead, &pool, &MatchWeights::default());
        for pair in scored.windows(2) {
            prop_assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn phone_normalization_is_idempotent(raw in "[0-9 ()+.-]{0,20}") {
        if let Some(once) = normalize_phone(&raw) {
            prop_assert!(once.chars().all(|c| c.is_ascii_digit()));
            let twice = normalize_phone(&once);
            // A second pass can only strip another "00" prefix
            prop_assert!(twice.as_deref().map_or(true, |t| once.ends_with(t)));
        }
    }
}

// Property: resolution and merge
proptest! {
    #[test]
    fn resolution_follows_thresholds(
        review in 0u8..=100u8,
        spread in 0u8..=100u8,
        lp in opt_phone(), le in opt_email(), ll in opt_word()
    ) {
        let auto_merge = review.saturating_add(spread).min(100);
        let thresholds = MatchThresholds::new(auto_merge, review).unwrap();
        let lead = lead(None, ll.clone(), le.clone(), lp.clone());
        let pool = vec![record(None, ll, le, lp)];
        let scored = score_candidates(&lead, &pool, &MatchWeights::default());

        match (resolve(&scored, &thresholds), scored.first()) {
            (Resolution::NoMatch, None) => {}
            (Resolution::NoMatch, Some(top)) => prop_assert!(top.confidence < review),
            (Resolution::AutoMerge(top), _) => prop_assert!(top.confidence >= auto_merge),
            (Resolution::ReviewRequired(all), _) => {
                prop_assert!(all.iter().all(|c| c.confidence >= review));
                prop_assert!(all[0].confidence < auto_merge);
            }
        }
    }

    #[test]
    fn merge_never_clears_or_overwrites(
        rf in opt_word(), rl in opt_word(), re in opt_email(), rp in opt_phone(),
        lf in opt_word(), ll in opt_word(), le in opt_email(), lp in opt_phone()
    ) {
        let mut customer = record(rf.clone(), rl.clone(), re.clone(), rp.clone());
        let before = customer.clone();
        let incoming = lead(lf.clone(), ll.clone(), le.clone(), lp.clone());

        fold_lead_into(&mut customer, &incoming, Utc::now());

        for (old, new, offered) in [
            (&before.first_name, &customer.first_name, &lf),
            (&before.last_name, &customer.last_name, &ll),
            (&before.email, &customer.email, &le),
            (&before.phone, &customer.phone, &lp),
        ] {
            let was_populated = old.as_deref().map_or(false, |v| !v.trim().is_empty());
            let offered_value = offered.as_deref().map_or(false, |v| !v.trim().is_empty());
            if was_populated {
                prop_assert_eq!(new, old);
            } else if offered_value {
                prop_assert_eq!(new, offered);
            }
        }
        prop_assert_eq!(customer.version, before.version + 1);
        prop_assert_eq!(customer.lead_refs.len(), 1);
    }
}
