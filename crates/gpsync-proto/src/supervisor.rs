//! Messages and clients of the supervisor `StatusService` and
//! `TerminalService`, generated from `proto/supervisor.proto`.

tonic::include_proto!("supervisor");
