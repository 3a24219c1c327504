//! End-to-end scenarios over loopback sockets and in-process channels.
