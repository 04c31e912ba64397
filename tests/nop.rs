use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use uring_engine::{opcode, Error, Ring};

const DEADLINE: Duration = Duration::from_secs(2);

fn wait_all(rx: &mpsc::Receiver<i32>, n: usize) -> anyhow::Result<Vec<i32>> {
    (0..n)
        .map(|_| Ok(rx.recv_timeout(DEADLINE)?))
        .collect()
}

#[test]
fn test_smoke_inline() -> anyhow::Result<()> {
    let mut ring = Ring::new(8)?;

    for _ in 0..2 {
        let (tx, rx) = mpsc::channel();
        for _ in 0..6 {
            let tx = tx.clone();
            unsafe {
                ring.submit(opcode::Nop::new().build(), move |result| {
                    tx.send(result).ok();
                })?;
            }
        }

        for result in wait_all(&rx, 6)? {
            assert_eq!(result, 0);
        }
    }

    let started = Instant::now();
    ring.dispose();
    assert!(started.elapsed() < DEADLINE);

    Ok(())
}

#[test]
fn test_smoke_async_dispatch() -> anyhow::Result<()> {
    let mut ring = Ring::builder()
        .completion_threads(4)
        .dispatch_async(true)
        .build(8)?;

    let submitter = thread::current().id();
    let (tx, rx) = mpsc::channel();
    for _ in 0..6 {
        let tx = tx.clone();
        unsafe {
            ring.submit(opcode::Nop::new().build(), move |result| {
                assert_ne!(thread::current().id(), submitter);
                tx.send(result).ok();
            })?;
        }
    }

    for result in wait_all(&rx, 6)? {
        assert_eq!(result, 0);
    }

    let started = Instant::now();
    ring.dispose();
    assert!(started.elapsed() < DEADLINE);

    Ok(())
}

#[test]
fn test_large() -> anyhow::Result<()> {
    const COUNT: usize = 16382;

    let mut ring = Ring::builder()
        .completion_threads(4)
        .dispatch_async(true)
        .build(16384)?;

    let (tx, rx) = mpsc::channel();
    let mut tokens = HashSet::new();
    let deadline = Instant::now() + DEADLINE;

    for _ in 0..COUNT {
        loop {
            let tx = tx.clone();
            let submitted = unsafe {
                ring.submit(opcode::Nop::new().build(), move |result| {
                    tx.send(result).ok();
                })
            };
            match submitted {
                Ok(token) => {
                    // Every issued token is distinct while pending.
                    assert!(tokens.insert(token));
                    break;
                }
                Err(Error::SubmissionQueueFull) => {
                    anyhow::ensure!(Instant::now() < deadline, "queue never drained");
                    thread::yield_now();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    assert_eq!(tokens.len(), COUNT);

    for result in wait_all(&rx, COUNT)? {
        assert_eq!(result, 0);
    }

    let started = Instant::now();
    ring.dispose();
    assert!(started.elapsed() < DEADLINE);

    Ok(())
}

#[test]
fn test_multi_producer() -> anyhow::Result<()> {
    let ring = std::sync::Arc::new(Ring::builder().completion_threads(2).build(64)?);

    let (tx, rx) = mpsc::channel();
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let ring = ring.clone();
            let tx = tx.clone();
            thread::spawn(move || -> anyhow::Result<()> {
                for _ in 0..50 {
                    loop {
                        let tx = tx.clone();
                        let submitted = unsafe {
                            ring.submit(opcode::Nop::new().build(), move |result| {
                                tx.send(result).ok();
                            })
                        };
                        match submitted {
                            Ok(_) => break,
                            Err(Error::SubmissionQueueFull) => thread::yield_now(),
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                Ok(())
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap()?;
    }
    for result in wait_all(&rx, 200)? {
        assert_eq!(result, 0);
    }

    Ok(())
}

#[test]
fn test_dispose_idle_ring() -> anyhow::Result<()> {
    let mut ring = Ring::builder().completion_threads(4).build(8)?;

    // Give the boss time to park.
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    ring.dispose();
    assert!(started.elapsed() < DEADLINE);

    Ok(())
}

#[test]
fn test_submit_after_dispose() -> anyhow::Result<()> {
    let mut ring = Ring::new(8)?;
    ring.dispose();

    let result = unsafe { ring.submit(opcode::Nop::new().build(), |_| {}) };
    match result {
        Err(Error::Disposed) => Ok(()),
        _ => anyhow::bail!("expected Disposed"),
    }
}
