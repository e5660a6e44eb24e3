use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flatwatch_adapters::{bundle_to_drafts, load_fixture_bundle};
use flatwatch_core::{compose_notification, Listing, Source};

fn bundle_path(source: Source) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source.slug())
        .join("listings.json")
}

#[test]
fn every_source_has_a_captured_bundle() {
    for source in Source::ALL {
        let path = bundle_path(source);
        assert!(path.exists(), "missing {}", path.display());
        let bundle = load_fixture_bundle(&path).expect("bundle parses");
        assert_eq!(bundle.source, source);
        assert!(bundle.captured_from_url.starts_with("https://"));
    }
}

#[test]
fn fixture_ids_are_unique_across_sources() {
    let mut seen = HashSet::new();
    for source in Source::ALL {
        let bundle = load_fixture_bundle(bundle_path(source)).expect("bundle parses");
        for draft in bundle_to_drafts(&bundle) {
            assert!(seen.insert(draft.id.clone()), "duplicate id {}", draft.id);
        }
    }
    assert_eq!(seen.len(), 8);
}

#[test]
fn complete_fixture_listings_compose_a_message_with_their_url() {
    let now = Utc::now();
    for source in Source::ALL {
        let bundle = load_fixture_bundle(bundle_path(source)).expect("bundle parses");
        for draft in bundle_to_drafts(&bundle) {
            let listing = Listing::from_draft(draft, now);
            if !listing.is_complete() {
                continue;
            }
            let notification = compose_notification(&listing);
            assert!(notification.text().contains(&listing.url), "{}", listing.id);
            assert!(notification.text().contains(source.display_name()));
        }
    }
}
