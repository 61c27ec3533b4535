// A TFTP server compliant with RFC 1350.
//
// Transfer begins with a request to read or write a file. If the server
// grants the request, the file moves in blocks of 512 bytes, each data
// packet carrying one block that must be acked before the next is sent.
// A data packet shorter than 512 bytes marks the end of the transfer.
//
// Requests arrive on the well-known port; each granted request gets its
// own socket on an ephemeral port (the server's transfer identifier for
// the session), and everything after the request flows between the two
// ephemeral endpoints. On packet loss the waiting side times out and
// retransmits the last thing it sent, so each side keeps exactly one
// packet around for retransmission.
//
// Errors are signaled with an error packet, which is never acked or
// retransmitted; timeouts cover the case where the error packet itself
// is lost. The one error that does not terminate a session is a datagram
// arriving from an unexpected source port, which is answered with an
// error to its sender and otherwise ignored.
//
// Module map:
// - `tftp`: the wire codec (packets, opcodes, error codes) and a thin
//   socket wrapper that speaks packets instead of bytes.
// - `processor`: the per-transfer state machines, which own the file
//   handle and block counter and never touch a socket.
// - `srv_conn`: the per-request session runner that ties one socket to
//   one state machine under a retransmission loop.
// - `server`: the listener that demultiplexes requests onto sessions.

pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod tftp;
