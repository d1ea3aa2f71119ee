//! End-to-end service test: setup against the mock network, a crafted
//! INTRODUCE2 from a client, the resulting RENDEZVOUS1 with a MAC the
//! client independently agrees on, and replay suppression.

mod common;

use common::{MockDialer, MockNetwork};
use microtor::core::unix_now;
use microtor::crypto::{
    credential, subcredential, tor_mac, BlindedKey, HS_PROTOID, HS_PROTOID_KEY, HS_PROTOID_MAC,
    HS_PROTOID_VERIFY,
};
use microtor::hs::descriptor::parse_descriptor;
use microtor::hs::intro::encrypt_introduce_plaintext;
use microtor::protocol::hs_cell::IntroducePlaintext;
use microtor::protocol::relay_cell::{LinkSpecifier, RelayCell, RelayCommand};
use microtor::storage::KEY_ED25519_PRIVATE;
use microtor::{BlobStore, Core, MemoryBlobStore, ServiceIdentity};
use std::sync::Arc;
use std::time::Duration;
use x25519_dalek::{PublicKey, StaticSecret};

const SERVICE_SEED: [u8; 32] = [0x09; 32];
const COOKIE: [u8; 20] = hex_literal::hex!("0102030405060708090a0b0c0d0e0f1011121314");

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// The client end of the hs-ntor derivation, written independently of the
/// service code so the two are checked against each other.
fn client_hs_ntor(
    client_secret: &StaticSecret,
    auth_key: &[u8; 32],
    enc_public: &[u8; 32],
    server_public: &[u8; 32],
) -> [u8; 32] {
    let client_pk = PublicKey::from(client_secret).to_bytes();
    let exp_xy = client_secret
        .diffie_hellman(&PublicKey::from(*server_public))
        .to_bytes();
    let exp_xb = client_secret
        .diffie_hellman(&PublicKey::from(*enc_public))
        .to_bytes();

    let mut rend_secret = Vec::new();
    rend_secret.extend_from_slice(&exp_xy);
    rend_secret.extend_from_slice(&exp_xb);
    rend_secret.extend_from_slice(auth_key);
    rend_secret.extend_from_slice(enc_public);
    rend_secret.extend_from_slice(&client_pk);
    rend_secret.extend_from_slice(server_public);
    rend_secret.extend_from_slice(HS_PROTOID);

    let verify = tor_mac(&rend_secret, HS_PROTOID_VERIFY);
    let _key_seed = tor_mac(&rend_secret, HS_PROTOID_KEY);

    let mut auth_input = Vec::new();
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(auth_key);
    auth_input.extend_from_slice(enc_public);
    auth_input.extend_from_slice(server_public);
    auth_input.extend_from_slice(&client_pk);
    auth_input.extend_from_slice(HS_PROTOID);
    auth_input.extend_from_slice(b"Server");
    tor_mac(&auth_input, HS_PROTOID_MAC)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setup_introduce_rendezvous_and_replay() {
    let now = unix_now();
    let net = MockNetwork::new(8, now);
    let dialer = Arc::new(MockDialer::new(&net));

    let mut core = Core::new(net.directory(), dialer.clone());
    let mut storage = MemoryBlobStore::new();
    storage.put(KEY_ED25519_PRIVATE, &SERVICE_SEED).unwrap();

    let hostname = core
        .setup_hidden_service(&mut storage, 8080, 80)
        .await
        .expect("service setup");
    assert_eq!(hostname, ServiceIdentity::from_seed(SERVICE_SEED).hostname);

    // Recover the published intro points the way a client would: derive
    // the blinded key and subcredential, find the current-period
    // descriptor among the uploads and open it.
    let master = ed25519_dalek::SigningKey::from_bytes(&SERVICE_SEED);
    let period = net.consensus.time_period();
    let blinded = BlindedKey::derive(&master, period, 1440).unwrap();
    let cred = credential(master.verifying_key().as_bytes());
    let subcred = subcredential(&cred, &blinded.public());

    let posted = dialer.all_posted_descriptors();
    assert!(!posted.is_empty(), "setup published no descriptors");
    let intro_points = posted
        .iter()
        .find_map(|d| parse_descriptor(d, &blinded.public(), &subcred, 0).ok())
        .expect("a current-period descriptor that parses");
    assert_eq!(intro_points.len(), 3);

    // Craft an INTRODUCE2 aimed at the first intro point, nominating mock
    // relay 7 as the rendezvous point.
    let client_secret = StaticSecret::from([0x31u8; 32]);
    let rend_relay = net.onion_relay(7);
    let plaintext = IntroducePlaintext {
        rendezvous_cookie: COOKIE,
        onion_key: rend_relay.ntor_onion_key,
        link_specifiers: vec![
            LinkSpecifier::Ipv4(rend_relay.address, rend_relay.or_port),
            LinkSpecifier::LegacyId(rend_relay.identity),
        ],
    };
    let body = encrypt_introduce_plaintext(
        &plaintext,
        &client_secret,
        &intro_points[0].auth_key,
        &intro_points[0].enc_key,
        &subcred,
    );

    let intro_chain = dialer
        .intro_chain_for(&intro_points[0].auth_key)
        .expect("chain that accepted this intro point");

    let core_task = tokio::spawn(core.run());

    dialer.inject(
        intro_chain,
        RelayCell::new(RelayCommand::Introduce2, 0, body.clone()),
    );

    let dialer_for_wait = dialer.clone();
    wait_until("RENDEZVOUS1", move || {
        !dialer_for_wait.all_rendezvous1().is_empty()
    })
    .await;

    let rendezvous1 = dialer.all_rendezvous1().remove(0);
    assert_eq!(rendezvous1.len(), 84);
    assert_eq!(&rendezvous1[0..20], &COOKIE);

    // The client derives the same AUTH_INPUT_MAC from Y.
    let server_public: [u8; 32] = rendezvous1[20..52].try_into().unwrap();
    let expected_mac = client_hs_ntor(
        &client_secret,
        &intro_points[0].auth_key,
        &intro_points[0].enc_key,
        &server_public,
    );
    assert_eq!(&rendezvous1[52..84], &expected_mac);

    // Replaying the identical INTRODUCE2 must not produce a second
    // rendezvous attempt.
    dialer.inject(
        intro_chain,
        RelayCell::new(RelayCommand::Introduce2, 0, body),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(dialer.all_rendezvous1().len(), 1);

    core_task.abort();
}
