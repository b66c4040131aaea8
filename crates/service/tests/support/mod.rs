//! Shared fixtures for the service integration tests
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::Stream;
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use common::crypt4gh::{encrypt_segment, Header, SecretKey, SEGMENT_SIZE};
use common::metadata::{ArchivedFile, DatasetEvent, MemoryMetadataProvider, RELEASE_EVENT};
use service::auth::{TrustMaterial, VisaAuthorizer, CONTROLLED_ACCESS_GRANTS};
use service::storage::ArchiveStore;

/// One archived file plus the keys that sealed it
pub struct Fixture {
    pub meta: MemoryMetadataProvider,
    pub archive_objects: Arc<InMemory>,
    pub archive: ArchiveStore,
    pub server_key: SecretKey,
}

pub fn fixture() -> Fixture {
    let archive_objects = Arc::new(InMemory::new());
    Fixture {
        meta: MemoryMetadataProvider::new(),
        archive: ArchiveStore::object(archive_objects.clone()),
        archive_objects,
        server_key: SecretKey::generate(),
    }
}

impl Fixture {
    /// Archive `plaintext` as `file_id` under the numeric object key
    /// `object_key`, sealed for the server key, and register it in the
    /// metadata store as a member of `dataset_id`.
    pub async fn archive_file(
        &self,
        file_id: &str,
        object_key: &str,
        dataset_id: &str,
        plaintext: &[u8],
    ) {
        let mut session_key = [0u8; 32];
        fill_bytes(&mut session_key);
        let header = Header::seal(&session_key, &self.server_key, &self.server_key.public())
            .unwrap();

        let mut body = Vec::new();
        for segment in plaintext.chunks(SEGMENT_SIZE) {
            body.extend_from_slice(&encrypt_segment(&session_key, segment));
        }
        self.archive_objects
            .put(&ObjectPath::from(object_key), body.into())
            .await
            .unwrap();

        self.meta.add_file(ArchivedFile {
            file_id: file_id.to_string(),
            file_path: object_key.to_string(),
            display_name: format!("{}.c4gh", file_id),
            file_size: None,
            checksum: None,
            checksum_type: None,
            decrypted_size: Some(plaintext.len() as i64),
            decrypted_checksum: None,
            decrypted_checksum_type: None,
            status: "READY".to_string(),
            header: hex::encode(header.serialize()),
        });
        self.meta.link(file_id, dataset_id);
    }

    pub fn release_dataset(&self, dataset_id: &str) {
        self.meta.push_event(DatasetEvent {
            dataset_id: dataset_id.to_string(),
            event: RELEASE_EVENT.to_string(),
            event_date: Utc::now(),
        });
    }

    pub fn deprecate_dataset(&self, dataset_id: &str) {
        self.meta.push_event(DatasetEvent {
            dataset_id: dataset_id.to_string(),
            event: "deprecated".to_string(),
            event_date: Utc::now() + Duration::seconds(1),
        });
    }
}

fn fill_bytes(buf: &mut [u8]) {
    // deterministic filler; test session keys need no CSPRNG
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(37).wrapping_add(11);
    }
}

pub async fn collect<S, E>(stream: S) -> Vec<u8>
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::fmt::Debug,
{
    let mut stream = Box::pin(stream);
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

pub fn sample_plaintext(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

/// Deterministic Ed25519 keypair as (PKCS#8 private, SPKI public) PEM
pub fn aai_keypair(seed: u8) -> (String, String) {
    let signing = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    let verifying = signing.verifying_key();

    let mut pkcs8 = vec![
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
        0x04, 0x20,
    ];
    pkcs8.extend_from_slice(&signing.to_bytes());
    let mut spki = vec![
        0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
    ];
    spki.extend_from_slice(verifying.to_bytes().as_ref());

    (
        pem::encode(&pem::Pem::new("PRIVATE KEY", pkcs8)),
        pem::encode(&pem::Pem::new("PUBLIC KEY", spki)),
    )
}

/// A signed visa token granting controlled access to `dataset_id`
pub fn visa_token(private_pem: &str, subject: &str, dataset_id: &str) -> String {
    let key = jsonwebtoken::EncodingKey::from_ed_pem(private_pem.as_bytes()).unwrap();
    let claims = serde_json::json!({
        "sub": subject,
        "iss": "https://aai.example.org",
        "exp": 4102444800u64,
        "ga4gh_visa_v1": {
            "type": CONTROLLED_ACCESS_GRANTS,
            "value": format!("https://ega.example.org/datasets/{}", dataset_id),
            "source": "https://ega.example.org",
            "by": "dac",
            "asserted": 1700000000u64,
        }
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::EdDSA),
        &claims,
        &key,
    )
    .unwrap()
}

/// An authorizer trusting `visa_public_pem` statically
pub fn authorizer(visa_public_pem: &str) -> VisaAuthorizer {
    VisaAuthorizer::new(TrustMaterial {
        passport_pem: Some(visa_public_pem.to_string()),
        visa_pem: Some(visa_public_pem.to_string()),
        // never contacted by these tests
        userinfo_endpoint: url::Url::parse("http://localhost:9/userinfo").unwrap(),
        openid_configuration_url: url::Url::parse(
            "http://localhost:9/.well-known/openid-configuration",
        )
        .unwrap(),
    })
    .unwrap()
}
