//! Wire schema for the strand log service.
//!
//! This crate holds the protobuf message types exchanged between clients and
//! servers, together with the frame codec both sides use on the wire. The
//! message structs are maintained by hand in the exact shape `prost-build`
//! emits, so the crate builds without a protoc toolchain while staying
//! byte-compatible with the schema.
//!
//! The encoded [`Record`] is also what the storage layer writes to disk, so
//! one encoding flows through the system end-to-end.

#![warn(clippy::all)]

pub mod frame;

/// Protobuf message types for the log service (package `log.v1`).
#[allow(missing_docs)]
pub mod v1 {
    /// A single log record: an opaque payload plus its server-assigned
    /// offset.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Record {
        #[prost(bytes = "bytes", tag = "1")]
        pub value: ::prost::bytes::Bytes,
        #[prost(uint64, tag = "2")]
        pub offset: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProduceRequest {
        #[prost(message, optional, tag = "1")]
        pub record: ::core::option::Option<Record>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProduceResponse {
        #[prost(uint64, tag = "1")]
        pub offset: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ConsumeRequest {
        #[prost(uint64, tag = "1")]
        pub offset: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ConsumeResponse {
        #[prost(message, optional, tag = "1")]
        pub record: ::core::option::Option<Record>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetServersRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetServersResponse {
        #[prost(message, repeated, tag = "1")]
        pub servers: ::prost::alloc::vec::Vec<Server>,
    }

    /// One cluster member as reported by `GetServers`.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Server {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub rpc_addr: ::prost::alloc::string::String,
        #[prost(bool, tag = "3")]
        pub is_leader: bool,
    }

    /// The request envelope carried in every client frame.
    ///
    /// `identity` is the caller's subject for authorization. With mutual TLS
    /// it would come from the peer certificate; the plain-TCP deployment
    /// carries it here instead.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(string, tag = "1")]
        pub identity: ::prost::alloc::string::String,
        #[prost(oneof = "request::Body", tags = "2, 3, 4, 5")]
        pub body: ::core::option::Option<request::Body>,
    }

    /// Nested message and enum types in `Request`.
    pub mod request {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Body {
            #[prost(message, tag = "2")]
            Produce(super::ProduceRequest),
            #[prost(message, tag = "3")]
            Consume(super::ConsumeRequest),
            /// Opens a server-push stream starting at the given offset.
            #[prost(message, tag = "4")]
            ConsumeStream(super::ConsumeRequest),
            #[prost(message, tag = "5")]
            GetServers(super::GetServersRequest),
        }
    }

    /// The response envelope.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(oneof = "response::Body", tags = "1, 2, 3, 4")]
        pub body: ::core::option::Option<response::Body>,
    }

    /// Nested message and enum types in `Response`.
    pub mod response {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Body {
            #[prost(message, tag = "1")]
            Produce(super::ProduceResponse),
            #[prost(message, tag = "2")]
            Consume(super::ConsumeResponse),
            #[prost(message, tag = "3")]
            Servers(super::GetServersResponse),
            #[prost(message, tag = "4")]
            Error(super::ErrorResponse),
        }
    }

    /// A failed call. `code` is a [`Code`] value.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ErrorResponse {
        #[prost(enumeration = "Code", tag = "1")]
        pub code_raw: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }

    /// Status codes carried by [`ErrorResponse`].
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Code {
        Ok = 0,
        Canceled = 1,
        /// The requested offset is outside the log's range.
        NotFound = 2,
        PermissionDenied = 3,
        /// A mutating call hit a non-leader; the client should re-resolve.
        NotLeader = 4,
        /// The cluster has no elected leader yet; retry with backoff.
        NoLeader = 5,
        Internal = 6,
    }

    impl Code {
        /// String value of the enum field names used in the ProtoBuf
        /// definition.
        pub fn as_str_name(&self) -> &'static str {
            match self {
                Code::Ok => "OK",
                Code::Canceled => "CANCELED",
                Code::NotFound => "NOT_FOUND",
                Code::PermissionDenied => "PERMISSION_DENIED",
                Code::NotLeader => "NOT_LEADER",
                Code::NoLeader => "NO_LEADER",
                Code::Internal => "INTERNAL",
            }
        }
    }
}

pub use v1::{
    request, response, Code, ConsumeRequest, ConsumeResponse, ErrorResponse, GetServersRequest,
    GetServersResponse, ProduceRequest, ProduceResponse, Record, Request, Response, Server,
};

impl Response {
    /// Builds an error response with the given code and detail message.
    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self {
            body: Some(response::Body::Error(ErrorResponse {
                code_raw: code as i32,
                message: message.into(),
            })),
        }
    }
}

impl ErrorResponse {
    /// Returns the decoded status code, or `Internal` for unknown values.
    pub fn code(&self) -> Code {
        Code::try_from(self.code_raw).unwrap_or(Code::Internal)
    }
}
