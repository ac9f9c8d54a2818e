//! JSON-RPC surface over the chain and pool

use crate::config::RpcSection;
use crate::node::Node;
use anyhow::{Context, Result};
use jsonrpc_core::{Error as RpcError, IoHandler, Params, Value};
use jsonrpc_http_server::{Server, ServerBuilder};
use rustcoin_core::transaction::Transaction;
use rustcoin_core::utils;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Start the HTTP JSON-RPC server. The returned handle keeps it alive.
pub fn start(config: &RpcSection, node: Arc<Node>) -> Result<Server> {
    let mut io = IoHandler::new();
    // RPC methods run on the server's own threads; they re-enter the
    // runtime through this handle
    let runtime = tokio::runtime::Handle::current();

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("getblockcount", move |_params: Params| {
            let tip = runtime.block_on(node.chain().tip());
            match tip {
                Some(tip) => Ok(Value::Number(tip.height.into())),
                None => Err(RpcError::internal_error()),
            }
        });
    }

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("getbestblockhash", move |_params: Params| {
            let tip = runtime.block_on(node.chain().tip());
            match tip {
                Some(tip) => Ok(Value::String(utils::hash_to_hex(&tip.hash))),
                None => Err(RpcError::internal_error()),
            }
        });
    }

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("getblock", move |params: Params| {
            let parsed: Vec<String> = params.parse()?;
            let hash_hex = parsed
                .first()
                .ok_or_else(|| RpcError::invalid_params("missing block hash"))?;
            let hash = utils::hex_to_hash(hash_hex)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;

            let block = runtime
                .block_on(node.chain().block_by_hash(&hash))
                .map_err(|_| RpcError::internal_error())?;
            match block {
                Some(b) => Ok(json!({
                    "hash": utils::hash_to_hex(&b.hash),
                    "height": b.height,
                    "active": b.active,
                    "version": b.header.version,
                    "previousblockhash": utils::hash_to_hex(&b.header.prev_block_hash),
                    "merkleroot": utils::hash_to_hex(&b.header.merkle_root),
                    "time": b.header.timestamp,
                    "bits": format!("{:08x}", b.header.bits),
                    "nonce": b.header.nonce,
                    "size": b.size,
                    "chainwork": format!("{:064x}", b.chain_work),
                })),
                None => Err(RpcError::invalid_params("block not found")),
            }
        });
    }

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("getrawmempool", move |_params: Params| {
            let hashes = runtime.block_on(node.pool().accepted_hashes());
            Ok(Value::Array(
                hashes
                    .iter()
                    .map(|h| Value::String(utils::hash_to_hex(h)))
                    .collect(),
            ))
        });
    }

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("getmempoolinfo", move |_params: Params| {
            let size = runtime.block_on(node.pool().len());
            Ok(json!({ "size": size }))
        });
    }

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("getconnectioncount", move |_params: Params| {
            let count = runtime.block_on(node.peers().connection_count());
            Ok(Value::Number(count.into()))
        });
    }

    {
        let node = node.clone();
        let runtime = runtime.clone();
        io.add_sync_method("sendrawtransaction", move |params: Params| {
            let parsed: Vec<String> = params.parse()?;
            let tx_hex = parsed
                .first()
                .ok_or_else(|| RpcError::invalid_params("missing transaction hex"))?;
            let bytes =
                hex::decode(tx_hex).map_err(|e| RpcError::invalid_params(e.to_string()))?;
            let tx = Transaction::deserialize(&bytes)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;

            match runtime.block_on(node.send_tx(tx)) {
                Ok(hash) => Ok(Value::String(utils::hash_to_hex(&hash))),
                Err(e) => Err(RpcError::invalid_params(e.to_string())),
            }
        });
    }

    let addr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parsing RPC listen address")?;
    let server = ServerBuilder::new(io)
        .threads(2)
        .start_http(&addr)
        .context("binding RPC listener")?;
    info!("🛰️  JSON-RPC listening on {}", addr);
    Ok(server)
}
