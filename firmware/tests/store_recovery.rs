use firmware::store::SLOT_BASE;
use firmware::{
    CoreError, KdfParams, MemoryRegion, PinCredential, RegionError, SecretStore, SessionKey,
};
use futures::executor::block_on;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use vault_core::{SecretKey, SecretName, SecretRecord};

fn rng(seed: u8) -> ChaCha20Rng {
    ChaCha20Rng::from_seed([seed; 32])
}

fn session() -> SessionKey {
    PinCredential::provision(b"1234", KdfParams::insecure_for_tests(), &mut rng(1))
        .expect("provision")
        .1
}

fn name(value: &str) -> SecretName {
    SecretName::new(value).expect("valid name")
}

fn record(label: &str, seed: &[u8]) -> SecretRecord {
    SecretRecord::new(name(label), SecretKey::new(seed.to_vec()).expect("seed"))
}

fn stored_slots(region: &MemoryRegion) -> usize {
    region.keys().filter(|key| *key >= SLOT_BASE).count()
}

#[test]
fn overwrite_interrupted_at_every_write_keeps_one_whole_record() {
    let key = session();

    // An overwrite is three mutations: new slot, manifest commit, old slot release.
    for budget in 0..=3 {
        let store = block_on(SecretStore::mount(MemoryRegion::new())).expect("mount");
        let mut rng = rng(2);
        block_on(store.put(&key, &mut rng, &record("mail", b"old"), false)).expect("seed put");

        let mut region = store.into_region();
        region.cut_power_after_writes(budget);
        let store = block_on(SecretStore::mount(region)).expect("mount");
        let result = block_on(store.put(&key, &mut rng, &record("mail", b"new"), true));

        let mut region = store.into_region();
        region.restore_power();
        let store = block_on(SecretStore::mount(region)).expect("remount");
        let stored = block_on(store.get(&key, &name("mail"))).expect("record readable");

        match budget {
            0 | 1 => {
                assert_eq!(result, Err(CoreError::Storage(RegionError::PowerLoss)));
                assert_eq!(stored.shared_key.as_bytes(), b"old");
            }
            _ => {
                assert_eq!(result, Ok(()));
                assert_eq!(stored.shared_key.as_bytes(), b"new");
            }
        }
        assert_eq!(store.list().expect("list"), vec![name("mail")]);
        assert_eq!(stored_slots(&store.into_region()), 1, "budget {budget}");
    }
}

#[test]
fn interrupted_delete_leaves_record_or_nothing() {
    let key = session();

    for budget in 0..=2 {
        let store = block_on(SecretStore::mount(MemoryRegion::new())).expect("mount");
        let mut rng = rng(3);
        block_on(store.put(&key, &mut rng, &record("mail", b"seed"), false)).expect("put");

        let mut region = store.into_region();
        region.cut_power_after_writes(budget);
        let store = block_on(SecretStore::mount(region)).expect("mount");
        let result = block_on(store.delete(&key, &name("mail")));

        let mut region = store.into_region();
        region.restore_power();
        let store = block_on(SecretStore::mount(region)).expect("remount");

        if budget == 0 {
            assert!(result.is_err());
            let stored = block_on(store.get(&key, &name("mail"))).expect("still present");
            assert_eq!(stored.shared_key.as_bytes(), b"seed");
        } else {
            assert_eq!(result, Ok(()));
            assert!(store.is_empty().expect("len"));
            assert_eq!(stored_slots(&store.into_region()), 0);
        }
    }
}

#[test]
fn interrupted_restore_keeps_previous_contents() {
    let key = session();
    let transport = firmware::TransportKey::new([0x33; 32]);
    let mut rng = rng(4);

    let source = block_on(SecretStore::mount(MemoryRegion::new())).expect("mount");
    for label in ["bank", "mail", "vpn"] {
        block_on(source.put(&key, &mut rng, &record(label, label.as_bytes()), false)).expect("put");
    }
    let bundle = block_on(source.export(&key, &transport, &mut rng, 0)).expect("export");

    let target = block_on(SecretStore::mount(MemoryRegion::new())).expect("mount");
    block_on(target.put(&key, &mut rng, &record("old", b"o"), false)).expect("put");
    let mut region = target.into_region();
    region.cut_power_after_writes(2);
    let target = block_on(SecretStore::mount(region)).expect("mount");
    assert!(block_on(target.restore(&key, &transport, &mut rng, &bundle)).is_err());

    let mut region = target.into_region();
    region.restore_power();
    let target = block_on(SecretStore::mount(region)).expect("remount");
    assert_eq!(target.list().expect("list"), vec![name("old")]);
    assert_eq!(stored_slots(&target.into_region()), 1);
}

#[test]
fn concurrent_mutation_is_refused_as_busy() {
    let key = session();
    let mut region = MemoryRegion::new();
    region.yield_on_write(true);
    let store = block_on(SecretStore::mount(region)).expect("mount");

    let mut first_rng = rng(5);
    let mut second_rng = rng(6);
    let mail = record("mail", b"one");
    let vpn = record("vpn", b"two");
    let (first, second) = block_on(async {
        futures::join!(
            store.put(&key, &mut first_rng, &mail, false),
            store.put(&key, &mut second_rng, &vpn, false),
        )
    });

    assert_eq!(first, Ok(()));
    assert_eq!(second, Err(CoreError::Busy));
    assert_eq!(store.list().expect("list"), vec![name("mail")]);
}

#[test]
fn reads_during_a_write_are_busy_not_torn() {
    let key = session();
    let mut region = MemoryRegion::new();
    region.yield_on_write(true);
    let store = block_on(SecretStore::mount(region)).expect("mount");
    let mut rng = rng(7);
    block_on(store.put(&key, &mut rng, &record("mail", b"one"), false)).expect("put");

    let replacement = record("mail", b"two");
    let mail = name("mail");
    let (write, read) = block_on(async {
        futures::join!(
            store.put(&key, &mut rng, &replacement, true),
            store.get(&key, &mail),
        )
    });
    assert_eq!(write, Ok(()));
    assert_eq!(read, Err(CoreError::Busy));

    let stored = block_on(store.get(&key, &name("mail"))).expect("get");
    assert_eq!(stored.shared_key.as_bytes(), b"two");
}
