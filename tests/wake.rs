use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sockpoll::{Interest, Poller, WaitStatus};

#[test]
fn spak_wakes_indefinite_wait() -> io::Result<()> {
    let poller = Arc::new(Poller::<()>::new()?);

    let waker = {
        let poller = poller.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            poller.spak().unwrap();
        })
    };

    let start = Instant::now();
    let status = poller.wait(None, |_, _, _| panic!("no socket is registered"))?;
    waker.join().unwrap();

    assert_eq!(status, WaitStatus::Ready(0));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!poller.is_killed());
    Ok(())
}

#[test]
fn spak_before_wait() -> io::Result<()> {
    let poller = Poller::<()>::new()?;
    poller.spak()?;

    assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Ready(0));
    assert_eq!(
        poller.wait(Some(Duration::ZERO), |_, _, _| {})?,
        WaitStatus::TimedOut
    );
    Ok(())
}

#[test]
fn spaks_coalesce() -> io::Result<()> {
    let poller = Poller::<()>::new()?;
    for _ in 0..10 {
        poller.spak()?;
    }

    assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Ready(0));
    assert_eq!(
        poller.wait(Some(Duration::from_millis(10)), |_, _, _| {})?,
        WaitStatus::TimedOut
    );
    Ok(())
}

#[test]
fn spak_with_ready_socket_dispatches_it() -> io::Result<()> {
    let poller = Poller::new()?;
    let (read, mut write) = tcp_pair()?;
    unsafe {
        poller.insert(&read, Interest::READABLE, Some(5u16))?;
    }

    write.write_all(&[1])?;
    thread::sleep(Duration::from_millis(20));
    poller.spak()?;

    // Either the pending wake-up is reported alone, or together with the socket.
    let mut seen = Vec::new();
    let status = poller.wait(Some(Duration::from_secs(1)), |_, _, data| seen.push(data.copied()))?;
    assert_eq!(status.events(), seen.len());

    let status = poller.wait(Some(Duration::from_secs(1)), |_, _, data| seen.push(data.copied()))?;
    assert_eq!(status, WaitStatus::Ready(1));
    assert!(seen.iter().all(|data| *data == Some(5)));
    Ok(())
}

#[test]
fn kill_stops_blocked_wait() -> io::Result<()> {
    let poller = Arc::new(Poller::<()>::new()?);

    let killer = {
        let poller = poller.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            poller.kill().unwrap();
        })
    };

    assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Killed);
    killer.join().unwrap();
    assert!(poller.is_killed());

    // Every later wait returns at once, even without a timeout.
    let start = Instant::now();
    for _ in 0..3 {
        assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Killed);
    }
    assert!(start.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[test]
fn kill_before_wait() -> io::Result<()> {
    let poller = Poller::<()>::new()?;
    poller.kill()?;
    assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Killed);
    Ok(())
}

#[test]
fn kill_wins_over_pending_spak() -> io::Result<()> {
    let poller = Poller::new()?;
    let (read, mut write) = tcp_pair()?;
    unsafe {
        poller.insert(&read, Interest::READABLE, Some(()))?;
    }
    write.write_all(&[1])?;

    poller.spak()?;
    poller.kill()?;
    poller.spak()?;

    let status = poller.wait(None, |_, _, _| panic!("killed pollers dispatch nothing"))?;
    assert_eq!(status, WaitStatus::Killed);
    Ok(())
}

#[test]
fn kill_survives_many_pokes() -> io::Result<()> {
    let poller = Poller::<u8>::new()?;
    let (read, _write) = tcp_pair()?;

    poller.kill()?;
    for _ in 0..1000 {
        unsafe {
            poller.insert(&read, Interest::READABLE, None)?;
        }
        poller.remove(&read);
    }

    assert_eq!(poller.wait(None, |_, _, _| {})?, WaitStatus::Killed);
    Ok(())
}

fn tcp_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let a = TcpStream::connect(listener.local_addr()?)?;
    let (b, _) = listener.accept()?;
    Ok((a, b))
}
