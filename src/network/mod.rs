pub mod message;
pub mod node;
pub mod runtime;
pub mod transport;

/*
    Nodes talk over point-to-point TCP channels, one per ordered pair of
    neighbors. Channels are reliable and FIFO: a message sent by a correct
    node to a running neighbor is delivered exactly once, and two messages
    on the same channel arrive in the order they were sent. There is no
    bound on delivery time.
*/
