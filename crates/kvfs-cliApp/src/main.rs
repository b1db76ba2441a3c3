use clap::Parser;
use fuser::MountOption;
use kvfs_api::HttpStore;
use kvfs_fuse::FuseFs;
use kvfs_store::KvFs;
use signal_hook::{consts::signal::*, iterator::Signals};
use std::fs::create_dir_all;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "kvfs",
    version = "0.1.0",
    about = "Mounts a hierarchical file system persisted in a remote key/value store"
)]
struct Cli {
    /// Directory to mount the file system on
    mount_point: String,

    /// Port of the key/value backend on localhost
    backend_port: u16,

    /// Number of objects the in-process cache may hold
    cache_capacity: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let Some(cache_capacity) = NonZeroUsize::new(cli.cache_capacity) else {
        eprintln!("cache capacity must be at least 1");
        std::process::exit(1);
    };

    let base_url = format!("http://localhost:{}/", cli.backend_port);
    let store = match HttpStore::new(&base_url) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("failed to set up the backend client for {base_url}: {e}");
            std::process::exit(1);
        }
    };

    let fs = FuseFs::new(KvFs::new(store, cache_capacity));

    if let Err(e) = create_dir_all(&cli.mount_point) {
        eprintln!(
            "mount point {} does not exist and cannot be created: {e}",
            cli.mount_point
        );
        std::process::exit(1);
    }

    let options = vec![MountOption::FSName("kvfs".to_string()), MountOption::RW];
    let session = match fuser::spawn_mount2(fs, &cli.mount_point, &options) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("failed to mount on {}: {e}", cli.mount_point);
            std::process::exit(1);
        }
    };

    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let pair_clone = pair.clone();

    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP]).expect("unable to register signals");
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "signal received");
            let (lock, cvar) = &*pair_clone;
            *lock.lock().unwrap() = true;
            cvar.notify_one();
        }
    });

    info!(
        mount_point = %cli.mount_point,
        backend = %base_url,
        cache_capacity = cache_capacity.get(),
        "kvfs mounted"
    );

    // waits for the signal
    let (lock, cvar) = &*pair;
    let _stop = cvar
        .wait_while(lock.lock().unwrap(), |stop| !*stop)
        .expect("mutex poisoned");
    info!("unmounting kvfs");
    drop(session);
}
