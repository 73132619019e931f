//! Command-line driver exercising the three canonical local-storage
//! scenarios end to end: a write/read round trip, a clone that diverges on
//! write, and an illegal direct page touch that takes down only the
//! offending thread.

use std::thread;

use clap::{Parser, Subcommand};
use simplelog::{Config, LevelFilter, SimpleLogger};

#[derive(Parser)]
#[command(
    name = "tls-demo",
    version,
    about = "Exercises the thread-local storage area library"
)]
struct Cli {
    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Create an LSA, write into it, and read the bytes back.
    RoundTrip {
        #[arg(long, default_value_t = 64)]
        size: u32,
    },
    /// Clone one thread's LSA into a second thread and show the two
    /// diverge once the clone writes.
    CloneIsolation,
    /// Touch a protected LSA page directly, outside the API, and show that
    /// only the offending thread dies.
    IllegalAccess,
}

fn main() {
    let _ = SimpleLogger::init(LevelFilter::Info, Config::default());
    let cli = Cli::parse();

    match cli.scenario {
        Scenario::RoundTrip { size } => round_trip(size),
        Scenario::CloneIsolation => clone_isolation(),
        Scenario::IllegalAccess => illegal_access(),
    }
}

fn round_trip(size: u32) {
    thread::spawn(move || {
        if tls::tls_create(size) != 0 {
            log::error!("tls_create failed");
            return;
        }
        let message = b"hello from the local storage area";
        let n = message.len().min(size as usize);
        if tls::tls_write(0, &message[..n]) != 0 {
            log::error!("tls_write failed");
            return;
        }
        let mut buf = vec![0u8; n];
        if tls::tls_read(0, &mut buf) != 0 {
            log::error!("tls_read failed");
            return;
        }
        log::info!("round trip read back {:?}", String::from_utf8_lossy(&buf));
        tls::tls_destroy();
    })
    .join()
    .expect("round trip thread panicked");
}

fn clone_isolation() {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let owner = thread::spawn(move || {
        tls::tls_create(32);
        tls::tls_write(0, b"original");
        ready_tx.send(thread::current().id()).unwrap();
        done_rx.recv().unwrap();
        tls::tls_destroy();
    });

    let owner_id = ready_rx.recv().unwrap();
    let cloner = thread::spawn(move || {
        tls::tls_clone(owner_id);
        let mut buf = [0u8; 8];
        tls::tls_read(0, &mut buf);
        log::info!("clone sees {:?} before writing", String::from_utf8_lossy(&buf));

        tls::tls_write(0, b"mutated!");
        tls::tls_read(0, &mut buf);
        log::info!(
            "clone sees {:?} after writing; the original is untouched",
            String::from_utf8_lossy(&buf)
        );
        tls::tls_destroy();
    });

    cloner.join().expect("cloner thread panicked");
    done_tx.send(()).unwrap();
    owner.join().expect("owner thread panicked");
}

fn illegal_access() {
    // Spawned with a raw pthread rather than `std::thread::spawn`: the
    // fault router ends this thread with `pthread_exit`, and that isn't
    // something std's unwind-catching thread entry trampoline is built to
    // cooperate with.
    extern "C" fn fault_in_raw_thread(_: *mut libc::c_void) -> *mut libc::c_void {
        if tls::tls_create(16) != 0 {
            log::error!("tls_create failed");
            return std::ptr::null_mut();
        }
        let tid = thread::current().id();
        let lsa_lock = registry::REGISTRY
            .fetch(tid)
            .expect("just created this LSA");
        let addr = lsa_lock.lock().pages[0].addr();

        log::warn!("touching a protected page directly; this thread will not return");
        unsafe { std::ptr::read_volatile(addr as *const u8) };
        unreachable!("fault router should have ended this thread first");
    }

    unsafe {
        let mut tid: libc::pthread_t = std::mem::zeroed();
        let rc = libc::pthread_create(
            &mut tid,
            std::ptr::null(),
            fault_in_raw_thread,
            std::ptr::null_mut(),
        );
        assert_eq!(rc, 0, "pthread_create failed");
        let rc = libc::pthread_join(tid, std::ptr::null_mut());
        assert_eq!(rc, 0, "pthread_join failed");
    }

    log::info!("process is still alive; the fault was contained to the worker thread");
}
