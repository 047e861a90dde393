//! Socket plumbing and the event loop: poll readiness, drain I/O, run the
//! idle and TTL timers. One thread, non-blocking sockets, level-triggered
//! `poll(2)`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::buf::Buffer;
use crate::commands::do_request;
use crate::db::Db;
use crate::list::{
    dlist_detach, dlist_head, dlist_insert_before, dlist_node, dlist_sentinel, DNodeRef,
};
use crate::protocol::{parse_request, response_begin, response_end, write_reply};
use crate::{monotonic_ms, BACKLOG, K_IDLE_TIMEOUT_MS, K_MAX_MSG};

/// Per-connection state: intent flags for the poller plus framed I/O
/// buffers.
struct Conn {
    socket: Socket,
    want_read: bool,
    want_write: bool,
    want_close: bool,
    incoming: Buffer,
    outgoing: Buffer,
    last_active_ms: u64,
    idle_node: DNodeRef,
}

impl Conn {
    fn new(socket: Socket, fd: RawFd) -> Self {
        Self {
            socket,
            want_read: true,
            want_write: false,
            want_close: false,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            last_active_ms: monotonic_ms(),
            idle_node: dlist_node(fd),
        }
    }

    fn poll_events(&self) -> PollFlags {
        let mut events = PollFlags::POLLERR;
        if self.want_read {
            events |= PollFlags::POLLIN;
        }
        if self.want_write {
            events |= PollFlags::POLLOUT;
        }
        events
    }
}

pub struct Server {
    listener: Socket,
    conns: HashMap<RawFd, Conn>,
    idle_list: DNodeRef,
    db: Db,
}

impl Server {
    /// Bind the listener; fails fast so the process can exit nonzero.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.bind(&SockAddr::from(addr))?;
        listener.set_nonblocking(true)?;
        listener.listen(BACKLOG)?;
        Ok(Self {
            listener,
            conns: HashMap::new(),
            idle_list: dlist_sentinel(),
            db: Db::new(),
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            // Readiness set: the listener plus every connection that wants
            // something. Connections flagged for close were destroyed at
            // the end of the previous iteration.
            let conn_fds: Vec<RawFd> = self.conns.keys().copied().collect();
            let mut poll_fds = Vec::with_capacity(conn_fds.len() + 1);
            poll_fds.push(PollFd::new(self.listener.as_raw_fd(), PollFlags::POLLIN));
            for fd in &conn_fds {
                let conn = &self.conns[fd];
                poll_fds.push(PollFd::new(conn.socket.as_raw_fd(), conn.poll_events()));
            }

            let timeout_ms = self.next_timer_ms();
            match poll(&mut poll_fds, timeout_ms) {
                Ok(_) => {}
                // A signal landed mid-wait; nothing is wrong.
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }

            let listener_ready = poll_fds[0]
                .revents()
                .unwrap_or(PollFlags::empty())
                .contains(PollFlags::POLLIN);
            let ready: Vec<(RawFd, PollFlags)> = conn_fds
                .iter()
                .zip(&poll_fds[1..])
                .map(|(&fd, pfd)| (fd, pfd.revents().unwrap_or(PollFlags::empty())))
                .collect();
            drop(poll_fds);

            if listener_ready {
                self.accept_new_conns();
            }
            for (fd, revents) in ready {
                if revents.is_empty() {
                    continue;
                }
                let mut progressed = false;
                let mut close = false;
                if let Some(conn) = self.conns.get_mut(&fd) {
                    if revents.contains(PollFlags::POLLIN) && conn.want_read {
                        progressed |= handle_read(conn, &mut self.db);
                    }
                    if revents.contains(PollFlags::POLLOUT) && conn.want_write {
                        progressed |= handle_write(conn);
                    }
                    close = revents.contains(PollFlags::POLLERR) || conn.want_close;
                }
                // The idle clock only resets when bytes actually moved; a
                // spurious wakeup must not defer the timeout.
                if progressed {
                    self.touch(fd);
                }
                if close {
                    self.destroy_conn(fd);
                }
            }

            self.process_timers(monotonic_ms());
        }
    }

    fn accept_new_conns(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    if let Err(e) = socket.set_nonblocking(true) {
                        error!("failed to set accepted socket non-blocking: {e}");
                        continue;
                    }
                    let fd = socket.as_raw_fd();
                    debug!("client connected: fd={fd} peer={:?}", peer.as_socket());
                    let conn = Conn::new(socket, fd);
                    dlist_insert_before(&self.idle_list, &conn.idle_node);
                    self.conns.insert(fd, conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // The listener stays up; a transient accept failure
                    // only costs this wakeup.
                    error!("accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Record activity: refresh the timestamp and requeue at the idle
    /// list's tail, keeping the ring ordered oldest-first.
    fn touch(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.last_active_ms = monotonic_ms();
            dlist_detach(&conn.idle_node);
            dlist_insert_before(&self.idle_list, &conn.idle_node);
        }
    }

    fn destroy_conn(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.remove(&fd) {
            dlist_detach(&conn.idle_node);
            debug!("connection closed: fd={fd}");
            // The socket closes when `conn` drops.
        }
    }

    /// Poll timeout: time until the nearest idle or TTL deadline, -1 for
    /// "wait indefinitely" when neither queue has one.
    fn next_timer_ms(&self) -> i32 {
        let now = monotonic_ms();
        let mut next: Option<u64> = None;
        if let Some(head) = dlist_head(&self.idle_list) {
            let fd = head.borrow().fd;
            if let Some(conn) = self.conns.get(&fd) {
                next = Some(conn.last_active_ms + K_IDLE_TIMEOUT_MS);
            }
        }
        if let Some(deadline) = self.db.next_ttl_deadline() {
            next = Some(next.map_or(deadline, |n| n.min(deadline)));
        }
        match next {
            None => -1,
            Some(t) if t <= now => 0,
            Some(t) => (t - now).min(i32::MAX as u64) as i32,
        }
    }

    /// Both timer queues run against one `now` sample: idle kicks first,
    /// then a bounded batch of TTL expirations.
    fn process_timers(&mut self, now: u64) {
        loop {
            let Some(head) = dlist_head(&self.idle_list) else {
                break;
            };
            let fd = head.borrow().fd;
            let Some(conn) = self.conns.get(&fd) else {
                // A stale node would mean destroy_conn missed a detach.
                dlist_detach(&head);
                continue;
            };
            if conn.last_active_ms + K_IDLE_TIMEOUT_MS >= now {
                break;
            }
            info!("idle timeout, closing fd={fd}");
            self.destroy_conn(fd);
        }

        self.db.process_expirations(now);
    }
}

/// One read burst: fill `incoming`, handle every complete request in it,
/// then flip to write-interest if responses are pending. True when bytes
/// were consumed off the socket, so the caller can refresh the idle clock.
fn handle_read(conn: &mut Conn, db: &mut Db) -> bool {
    let mut buf = [0u8; 64 * 1024];
    match conn.socket.read(&mut buf) {
        Ok(0) => {
            if conn.incoming.is_empty() {
                debug!("client closed connection");
            } else {
                warn!("unexpected EOF mid-message");
            }
            conn.want_close = true;
            return false;
        }
        Ok(n) => conn.incoming.append(&buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return false,
        Err(e) => {
            warn!("read error: {e}");
            conn.want_close = true;
            return false;
        }
    }

    while try_one_request(conn, db) {}

    if !conn.outgoing.is_empty() {
        conn.want_read = false;
        conn.want_write = true;
        // The socket is likely writable right now; skip a poll round.
        handle_write(conn);
    }
    true
}

/// Parse and serve one request from `incoming`; false when more bytes are
/// needed or the connection is being dropped.
fn try_one_request(conn: &mut Conn, db: &mut Db) -> bool {
    if conn.incoming.len() < 4 {
        return false;
    }
    let msg_len =
        u32::from_le_bytes(conn.incoming.data()[..4].try_into().unwrap()) as usize;
    if msg_len > K_MAX_MSG {
        warn!("oversized message ({msg_len} bytes), dropping connection");
        conn.want_close = true;
        return false;
    }
    if conn.incoming.len() < 4 + msg_len {
        return false;
    }

    let cmd = match parse_request(&conn.incoming.data()[4..4 + msg_len]) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("bad request framing: {e}, dropping connection");
            conn.want_close = true;
            return false;
        }
    };
    conn.incoming.consume(4 + msg_len);

    let reply = do_request(db, &cmd);
    let header_pos = response_begin(&mut conn.outgoing);
    write_reply(&mut conn.outgoing, &reply);
    response_end(&mut conn.outgoing, header_pos);
    true
}

/// One write burst: drain `outgoing`, flip back to read-interest when it
/// empties. True when bytes were pushed to the socket.
fn handle_write(conn: &mut Conn) -> bool {
    debug_assert!(!conn.outgoing.is_empty());
    match conn.socket.write(conn.outgoing.data()) {
        Ok(0) => {
            conn.want_close = true;
            false
        }
        Ok(n) => {
            conn.outgoing.consume(n);
            if conn.outgoing.is_empty() {
                conn.want_write = false;
                conn.want_read = true;
            }
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
        Err(e) => {
            warn!("write error: {e}");
            conn.want_close = true;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::dlist_empty;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// A framed request: u32 total length, u32 argc, argc x (u32 len + bytes).
    fn frame(args: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(args.len() as u32).to_le_bytes());
        for arg in args {
            body.extend_from_slice(&(arg.len() as u32).to_le_bytes());
            body.extend_from_slice(arg.as_bytes());
        }
        let mut msg = (body.len() as u32).to_le_bytes().to_vec();
        msg.extend_from_slice(&body);
        msg
    }

    fn loose_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
    }

    /// A connection whose socket is never read or written; buffer-level
    /// tests drive `incoming`/`outgoing` directly.
    fn test_conn() -> Conn {
        let socket = loose_socket();
        let fd = socket.as_raw_fd();
        Conn::new(socket, fd)
    }

    fn add_conn(server: &mut Server, last_active_ms: u64) -> RawFd {
        let socket = loose_socket();
        let fd = socket.as_raw_fd();
        let mut conn = Conn::new(socket, fd);
        conn.last_active_ms = last_active_ms;
        dlist_insert_before(&server.idle_list, &conn.idle_node);
        server.conns.insert(fd, conn);
        fd
    }

    /// Split a response stream back into framed bodies.
    fn split_responses(data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            out.push(data[pos..pos + len].to_vec());
            pos += len;
        }
        out
    }

    #[test]
    fn pipelined_requests_respond_in_order() {
        let mut db = Db::new();
        let mut conn = test_conn();
        // One burst carrying four requests.
        for req in [
            frame(&["set", "a", "1"]),
            frame(&["set", "b", "2"]),
            frame(&["get", "a"]),
            frame(&["get", "b"]),
        ] {
            conn.incoming.append(&req);
        }
        while try_one_request(&mut conn, &mut db) {}
        assert!(conn.incoming.is_empty());
        assert!(!conn.want_close);

        let responses = split_responses(conn.outgoing.data());
        assert_eq!(responses.len(), 4);
        // NIL, NIL, then the values in request order.
        assert_eq!(responses[0], vec![0]);
        assert_eq!(responses[1], vec![0]);
        assert_eq!(responses[2], vec![2, 1, 0, 0, 0, b'1']);
        assert_eq!(responses[3], vec![2, 1, 0, 0, 0, b'2']);
    }

    #[test]
    fn incomplete_request_waits_for_more_bytes() {
        let mut db = Db::new();
        let mut conn = test_conn();
        let req = frame(&["set", "k", "v"]);
        conn.incoming.append(&req[..5]);
        assert!(!try_one_request(&mut conn, &mut db));
        assert!(conn.outgoing.is_empty());
        assert!(!conn.want_close);

        conn.incoming.append(&req[5..]);
        assert!(try_one_request(&mut conn, &mut db));
        assert_eq!(split_responses(conn.outgoing.data()), vec![vec![0]]);
    }

    #[test]
    fn oversized_frame_marks_connection_for_close() {
        let mut db = Db::new();
        let mut conn = test_conn();
        conn.incoming
            .append(&((K_MAX_MSG as u32) + 1).to_le_bytes());
        assert!(!try_one_request(&mut conn, &mut db));
        assert!(conn.want_close);
        assert!(conn.outgoing.is_empty());
    }

    #[test]
    fn idle_timeout_destroys_stale_connection() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(server.next_timer_ms(), -1);

        let stale = add_conn(&mut server, 0);
        let fresh = add_conn(&mut server, K_IDLE_TIMEOUT_MS);
        let timeout = server.next_timer_ms();
        assert!((0..=K_IDLE_TIMEOUT_MS as i32).contains(&timeout));

        // Just past the first deadline: only the stale connection goes.
        server.process_timers(K_IDLE_TIMEOUT_MS + 1);
        assert!(!server.conns.contains_key(&stale));
        assert!(server.conns.contains_key(&fresh));
        let head = dlist_head(&server.idle_list).unwrap();
        assert_eq!(head.borrow().fd, fresh);

        server.process_timers(2 * K_IDLE_TIMEOUT_MS + 2);
        assert!(server.conns.is_empty());
        assert!(dlist_empty(&server.idle_list));
    }

    #[test]
    fn serves_pipelined_commands_over_tcp() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = server.listener.local_addr().unwrap().as_socket().unwrap();
            tx.send(addr).unwrap();
            let _ = server.run();
        });

        let addr = rx.recv().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut batch = Vec::new();
        for req in [
            frame(&["set", "a", "1"]),
            frame(&["set", "b", "2"]),
            frame(&["get", "a"]),
            frame(&["get", "b"]),
        ] {
            batch.extend_from_slice(&req);
        }
        stream.write_all(&batch).unwrap();

        let mut read_response = || {
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).unwrap();
            let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
            stream.read_exact(&mut body).unwrap();
            body
        };
        assert_eq!(read_response(), vec![0]);
        assert_eq!(read_response(), vec![0]);
        assert_eq!(read_response(), vec![2, 1, 0, 0, 0, b'1']);
        assert_eq!(read_response(), vec![2, 1, 0, 0, 0, b'2']);
    }
}
