use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sockpoll::{Interest, Poller, WaitStatus};

#[test]
fn insert_during_wait_is_observed() -> io::Result<()> {
    let poller = Arc::new(Poller::new()?);
    let (read, mut write) = tcp_pair()?;
    write.write_all(&[1])?;
    let fd = read.as_raw_fd();

    let inserter = {
        let poller = poller.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            unsafe {
                poller.insert(fd, Interest::READABLE, Some(11)).unwrap();
            }
        })
    };

    let mut seen = Vec::new();
    let status = poller.wait(Some(Duration::from_secs(5)), |fd, ev, data| {
        seen.push((fd, ev, data.copied()))
    })?;
    inserter.join().unwrap();

    assert_eq!(status, WaitStatus::Ready(1));
    assert_eq!(seen, [(fd, Interest::READABLE, Some(11))]);
    Ok(())
}

#[test]
fn modify_during_wait_is_observed() -> io::Result<()> {
    let poller = Arc::new(Poller::new()?);
    let (read, mut write) = tcp_pair()?;
    write.write_all(&[1])?;
    unsafe {
        poller.insert(&read, Interest::NONE, Some("idle"))?;
    }

    let modifier = {
        let poller = poller.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            poller.modify(&read, Interest::READABLE, Some("busy")).unwrap();
            read
        })
    };

    let mut seen = Vec::new();
    let status = poller.wait(Some(Duration::from_secs(5)), |_, _, data| seen.push(data.copied()))?;
    let _read = modifier.join().unwrap();

    assert_eq!(status, WaitStatus::Ready(1));
    assert_eq!(seen, [Some("busy")]);
    Ok(())
}

#[test]
fn remove_during_wait_silences_socket() -> io::Result<()> {
    let poller = Arc::new(Poller::new()?);
    let (read, mut write) = tcp_pair()?;
    unsafe {
        poller.insert(&read, Interest::READABLE, Some(()))?;
    }

    let remover = {
        let poller = poller.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            poller.remove(&read);
            write.write_all(&[1]).unwrap();
            thread::sleep(Duration::from_millis(50));
            poller.spak().unwrap();
            (read, write)
        })
    };

    let mut callbacks = 0;
    let status = poller.wait(None, |_, _, _| callbacks += 1)?;
    let _pair = remover.join().unwrap();

    assert_eq!(status, WaitStatus::Ready(0));
    assert_eq!(callbacks, 0);
    assert!(poller.is_empty());
    Ok(())
}

#[test]
fn many_threads_mutate_while_waiting() -> io::Result<()> {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;

    let poller = Arc::new(Poller::<usize>::new()?);
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let workers = (0..THREADS)
        .map(|i| {
            let poller = poller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> io::Result<()> {
                let (read, _write) = tcp_pair()?;
                barrier.wait();
                for round in 0..ROUNDS {
                    unsafe {
                        poller.insert(&read, Interest::READABLE, Some(i * ROUNDS + round))?;
                    }
                    poller.modify(&read, Interest::all(), None)?;
                    poller.remove(&read);
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();

    barrier.wait();
    while !workers.iter().all(|worker| worker.is_finished()) {
        // Idle sockets only: a wait either times out or sees a writable socket.
        let status = poller.wait(Some(Duration::from_millis(5)), |_, ev, data| {
            assert!(ev.contains(Interest::WRITABLE));
            assert!(data.is_some());
        })?;
        assert!(!status.is_killed());
    }

    for worker in workers {
        worker.join().unwrap()?;
    }
    assert!(poller.is_empty());
    Ok(())
}

#[test]
fn kill_from_callback_of_another_poller() -> io::Result<()> {
    let control = Arc::new(Poller::<()>::new()?);
    let worker = {
        let control = control.clone();
        thread::spawn(move || control.wait(None, |_, _, _| {}).unwrap())
    };

    let poller = Poller::new()?;
    let (read, mut write) = tcp_pair()?;
    unsafe {
        poller.insert(&read, Interest::READABLE, Some(()))?;
    }
    write.write_all(&[1])?;

    poller.wait(Some(Duration::from_secs(1)), |_, _, _| control.kill().unwrap())?;
    assert_eq!(worker.join().unwrap(), WaitStatus::Killed);
    Ok(())
}

fn tcp_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let a = TcpStream::connect(listener.local_addr()?)?;
    let (b, _) = listener.accept()?;
    Ok((a, b))
}
