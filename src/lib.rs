//! blockflow — a distributed home-automation block runtime.
//!
//! Users declare a dataflow graph of long-running "blocks" in YAML; a
//! cluster of cooperating nodes agrees (via Raft) on which node hosts
//! each block, starts and supervises the blocks, and routes events
//! between block outputs and inputs across the network.
//!
//! Module map, in dependency order:
//!
//! | Module       | Responsibility                                     |
//! |--------------|----------------------------------------------------|
//! | `config`     | YAML cluster + block-graph configuration           |
//! | `errors`     | Error taxonomy                                     |
//! | `raft`       | openraft storage, transport glue, startup          |
//! | `grpc`       | Consensus transport service (tonic)                |
//! | `store`      | Replicated KV facade, single-node fast path        |
//! | `resource`   | Resource specs, fitness probing, startup evaluator |
//! | `block`      | Block trait, registry, built-in blocks             |
//! | `placement`  | Fitness scoring and owner assignment               |
//! | `dispatch`   | Event queues, fan-out, local delivery              |
//! | `rpc`        | Event RPC HTTP server (`/rpc`, `/status`)          |
//! | `supervisor` | Block lifecycle reconciliation                     |

pub mod block;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod grpc;
pub mod placement;
pub mod raft;
pub mod resource;
pub mod rpc;
pub mod store;
pub mod supervisor;
