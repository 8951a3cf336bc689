/// Identifier of a conversion job as it appears on the wire.
///
/// Either a client-generated temporary id or the id echoed back by the
/// conversion endpoint.
pub type JobId = String;
