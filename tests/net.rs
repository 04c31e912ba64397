use std::io::Write as _;
use std::mem;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::Duration;

use uring_engine::{opcode, opcode::Target, opcode::Timespec, Flags, Ring};

const DEADLINE: Duration = Duration::from_secs(2);

#[test]
fn test_accept_connect() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let ring = Ring::new(8)?;
    let (tx, rx) = mpsc::channel();

    let mut sockaddr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::Accept::new(
                    Target::Fd(listener.as_raw_fd()),
                    &mut sockaddr as *mut _ as *mut libc::sockaddr,
                    &mut addrlen,
                )
                .build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }

    let _client = TcpStream::connect(addr)?;
    let accepted = rx.recv_timeout(DEADLINE)?;
    anyhow::ensure!(accepted >= 0, "accept failed: {}", accepted);
    unsafe { libc::close(accepted) };

    Ok(())
}

#[test]
fn test_connect() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let ring = Ring::new(8)?;
    let (tx, rx) = mpsc::channel();

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    anyhow::ensure!(sock >= 0, "socket failed");

    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes([127, 0, 0, 1]),
    };

    unsafe {
        ring.submit(
            opcode::Connect::new(
                Target::Fd(sock),
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
            .build(),
            move |result| {
                tx.send(result).ok();
            },
        )?;
    }

    assert_eq!(rx.recv_timeout(DEADLINE)?, 0);
    let (_peer, _) = listener.accept()?;
    unsafe { libc::close(sock) };

    Ok(())
}

#[test]
fn test_send_recv() -> anyhow::Result<()> {
    let (a, b) = UnixStream::pair()?;
    let ring = Ring::new(8)?;
    let (tx, rx) = mpsc::channel();

    let payload = b"ping";
    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::Send::new(Target::Fd(a.as_raw_fd()), payload.as_ptr(), 4).build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }
    assert_eq!(rx.recv_timeout(DEADLINE)?, 4);

    let mut buf = [0u8; 16];
    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::Recv::new(Target::Fd(b.as_raw_fd()), buf.as_mut_ptr(), buf.len() as u32)
                    .build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }
    assert_eq!(rx.recv_timeout(DEADLINE)?, 4);
    assert_eq!(&buf[..4], payload);

    Ok(())
}

#[test]
fn test_sendmsg_recvmsg() -> anyhow::Result<()> {
    let (a, b) = UnixStream::pair()?;
    let ring = Ring::new(8)?;
    let (tx, rx) = mpsc::channel();

    let payload = b"hello, msghdr";
    let send_iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut _,
        iov_len: payload.len(),
    };
    let mut send_msg: libc::msghdr = unsafe { mem::zeroed() };
    send_msg.msg_iov = &send_iov as *const _ as *mut _;
    send_msg.msg_iovlen = 1;
    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::SendMsg::new(Target::Fd(a.as_raw_fd()), &send_msg).build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }
    assert_eq!(rx.recv_timeout(DEADLINE)?, payload.len() as i32);

    let mut buf = [0u8; 64];
    let recv_iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut _,
        iov_len: buf.len(),
    };
    let mut recv_msg: libc::msghdr = unsafe { mem::zeroed() };
    recv_msg.msg_iov = &recv_iov as *const _ as *mut _;
    recv_msg.msg_iovlen = 1;
    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::RecvMsg::new(Target::Fd(b.as_raw_fd()), &mut recv_msg).build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }
    assert_eq!(rx.recv_timeout(DEADLINE)?, payload.len() as i32);
    assert_eq!(&buf[..payload.len()], payload);

    Ok(())
}

#[test]
fn test_poll_add_fires_on_readable() -> anyhow::Result<()> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    let ring = Ring::new(8)?;
    let (tx, rx) = mpsc::channel();

    unsafe {
        ring.submit(
            opcode::PollAdd::new(Target::Fd(read_fd), libc::POLLIN).build(),
            move |result| {
                tx.send(result).ok();
            },
        )?;
    }

    nix::unistd::write(write_fd, b"x")?;
    let events = rx.recv_timeout(DEADLINE)?;
    anyhow::ensure!(events >= 0, "poll failed: {}", events);
    assert_ne!(events & libc::POLLIN as i32, 0);

    nix::unistd::close(read_fd).ok();
    nix::unistd::close(write_fd).ok();
    Ok(())
}

#[test]
fn test_poll_remove() -> anyhow::Result<()> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    let ring = Ring::new(8)?;
    let (poll_tx, poll_rx) = mpsc::channel();
    let (remove_tx, remove_rx) = mpsc::channel();

    let token = unsafe {
        ring.submit(
            opcode::PollAdd::new(Target::Fd(read_fd), libc::POLLIN).build(),
            move |result| {
                poll_tx.send(result).ok();
            },
        )?
    };

    unsafe {
        ring.submit(opcode::PollRemove::new(token).build(), move |result| {
            remove_tx.send(result).ok();
        })?;
    }

    // The removed poll completes with -ECANCELED; the remove itself reports
    // whether it found the target (racing with completion is legal).
    assert_eq!(poll_rx.recv_timeout(DEADLINE)?, -libc::ECANCELED);
    let removed = remove_rx.recv_timeout(DEADLINE)?;
    anyhow::ensure!(
        removed == 0 || removed == -libc::ENOENT,
        "unexpected poll remove result: {}",
        removed
    );

    nix::unistd::close(read_fd).ok();
    nix::unistd::close(write_fd).ok();
    Ok(())
}

#[test]
fn test_timeout_expires() -> anyhow::Result<()> {
    let ring = Ring::new(8)?;
    let (tx, rx) = mpsc::channel();

    let ts = Timespec {
        tv_sec: 0,
        tv_nsec: 50_000_000,
    };
    unsafe {
        ring.submit(opcode::Timeout::new(&ts).build(), move |result| {
            tx.send(result).ok();
        })?;
    }

    assert_eq!(rx.recv_timeout(DEADLINE)?, -libc::ETIME);
    Ok(())
}

#[test]
fn test_timeout_satisfied_by_completions() -> anyhow::Result<()> {
    let ring = Ring::new(8)?;
    let (timeout_tx, timeout_rx) = mpsc::channel();
    let (nop_tx, nop_rx) = mpsc::channel();

    let ts = Timespec {
        tv_sec: 30,
        tv_nsec: 0,
    };
    unsafe {
        ring.submit(
            opcode::Timeout::new(&ts).count(1).build(),
            move |result| {
                timeout_tx.send(result).ok();
            },
        )?;
        ring.submit(opcode::Nop::new().build(), move |result| {
            nop_tx.send(result).ok();
        })?;
    }

    assert_eq!(nop_rx.recv_timeout(DEADLINE)?, 0);
    // Satisfied by the nop completing, not by expiry.
    assert_eq!(timeout_rx.recv_timeout(DEADLINE)?, 0);
    Ok(())
}

#[test]
fn test_timeout_remove() -> anyhow::Result<()> {
    let ring = Ring::new(8)?;
    let (timeout_tx, timeout_rx) = mpsc::channel();
    let (remove_tx, remove_rx) = mpsc::channel();

    let ts = Timespec {
        tv_sec: 30,
        tv_nsec: 0,
    };
    let token = unsafe {
        ring.submit(opcode::Timeout::new(&ts).build(), move |result| {
            timeout_tx.send(result).ok();
        })?
    };

    unsafe {
        ring.submit(opcode::TimeoutRemove::new(token).build(), move |result| {
            remove_tx.send(result).ok();
        })?;
    }

    assert_eq!(timeout_rx.recv_timeout(DEADLINE)?, -libc::ECANCELED);
    let removed = remove_rx.recv_timeout(DEADLINE)?;
    anyhow::ensure!(
        removed == 0 || removed == -libc::ENOENT,
        "unexpected timeout remove result: {}",
        removed
    );
    Ok(())
}

#[test]
fn test_link_timeout_cancels_stalled_read() -> anyhow::Result<()> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    let ring = Ring::new(8)?;
    let (read_tx, read_rx) = mpsc::channel();
    let (timer_tx, timer_rx) = mpsc::channel();

    let mut buf = [0u8; 8];
    let iovec = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut _,
        iov_len: buf.len(),
    };
    let ts = Timespec {
        tv_sec: 0,
        tv_nsec: 50_000_000,
    };

    unsafe {
        ring.submit_many(vec![
            (
                opcode::Readv::new(Target::Fd(read_fd), &iovec, 1)
                    .build()
                    .flags(Flags::IO_LINK),
                Box::new(move |result| {
                    read_tx.send(result).ok();
                }),
            ),
            (
                opcode::LinkTimeout::new(&ts).build(),
                Box::new(move |result| {
                    timer_tx.send(result).ok();
                }),
            ),
        ])?;
    }

    // Nothing ever arrives on the pipe; the linked timeout cancels the read.
    assert_eq!(read_rx.recv_timeout(DEADLINE)?, -libc::ECANCELED);
    let timer = timer_rx.recv_timeout(DEADLINE)?;
    anyhow::ensure!(
        timer == -libc::ETIME || timer == 0,
        "unexpected link timeout result: {}",
        timer
    );

    nix::unistd::close(read_fd).ok();
    nix::unistd::close(write_fd).ok();
    Ok(())
}

#[test]
fn test_async_cancel() -> anyhow::Result<()> {
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    let ring = Ring::new(8)?;
    let (poll_tx, poll_rx) = mpsc::channel();
    let (cancel_tx, cancel_rx) = mpsc::channel();

    let token = unsafe {
        ring.submit(
            opcode::PollAdd::new(Target::Fd(read_fd), libc::POLLIN).build(),
            move |result| {
                poll_tx.send(result).ok();
            },
        )?
    };

    unsafe {
        ring.submit(opcode::AsyncCancel::new(token).build(), move |result| {
            cancel_tx.send(result).ok();
        })?;
    }

    // Cancellation is best-effort: the original op reports its own fate and
    // the cancel reports whether it landed.
    assert_eq!(poll_rx.recv_timeout(DEADLINE)?, -libc::ECANCELED);
    let canceled = cancel_rx.recv_timeout(DEADLINE)?;
    anyhow::ensure!(
        canceled == 0 || canceled == -libc::ENOENT || canceled == -libc::EALREADY,
        "unexpected cancel result: {}",
        canceled
    );

    nix::unistd::close(read_fd).ok();
    nix::unistd::close(write_fd).ok();
    Ok(())
}

#[test]
fn test_tcp_echo_round_trip() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let ring = Ring::builder().completion_threads(2).build(16)?;
    let (tx, rx) = mpsc::channel();

    let mut client = TcpStream::connect(addr)?;
    let (server, _) = listener.accept()?;
    client.write_all(b"echo?")?;

    let mut buf = [0u8; 5];
    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::Recv::new(Target::Fd(server.as_raw_fd()), buf.as_mut_ptr(), 5).build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }
    assert_eq!(rx.recv_timeout(DEADLINE)?, 5);
    assert_eq!(&buf, b"echo?");

    {
        let tx = tx.clone();
        unsafe {
            ring.submit(
                opcode::Send::new(Target::Fd(server.as_raw_fd()), buf.as_ptr(), 5).build(),
                move |result| {
                    tx.send(result).ok();
                },
            )?;
        }
    }
    assert_eq!(rx.recv_timeout(DEADLINE)?, 5);

    use std::io::Read as _;
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed)?;
    assert_eq!(&echoed, b"echo?");

    Ok(())
}
