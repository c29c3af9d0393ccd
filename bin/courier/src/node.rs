use crate::{cli::commands::NodeCommand, config::Config, webhook::WebhookMessager};
use courier_api::{serve, ApiState};
use courier_fabric::ConnectionFabric;
use courier_gateway::{ChainClient, EthGateway, LogSubscriber};
use courier_indexer::Indexer;
use courier_primitives::{
    consts::queue::DEFAULT_MAX_RETRIES,
    provider::{create_http_provider, create_ws_provider},
};
use courier_queue::{Service, TimeoutReconciler, UserOpProcessor};
use courier_rpc::{
    eth_api::EthApiServer, paymaster_api::PaymasterApiServer, EthApiServerImpl, JsonRpcServer,
    PaymasterApiServerImpl,
};
use courier_store::Store;
use ethers::providers::JsonRpcClient;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn launch(args: NodeCommand, config: Config) -> eyre::Result<()> {
    info!("starting engine");

    if args.polling {
        info!("running in polling mode");
        let provider =
            Arc::new(create_http_provider(&config.rpc_url, Duration::from_millis(500)).await?);
        let gateway = Arc::new(EthGateway::new(provider).await?);

        run(args, config, gateway, None).await
    } else {
        info!("running in streaming mode");
        let provider = Arc::new(create_ws_provider(&config.rpc_ws_url).await?);
        let gateway = Arc::new(EthGateway::new(provider).await?);
        let subscriber: Arc<dyn LogSubscriber> = gateway.clone();

        run(args, config, gateway, Some(subscriber)).await
    }
}

async fn run<P: JsonRpcClient + 'static>(
    args: NodeCommand,
    config: Config,
    gateway: Arc<EthGateway<P>>,
    subscriber: Option<Arc<dyn LogSubscriber>>,
) -> eyre::Result<()> {
    let cancel = CancellationToken::new();
    let chain: Arc<dyn ChainClient> = gateway.clone();

    let chain_id = chain.chain_id();
    info!(chain = %chain_id, name = %config.chain_name, "node running");

    let store = Store::connect(
        &chain_id.to_string(),
        &config.writer_dsn(),
        &config.reader_dsn(),
        &config.db_secret,
    )
    .await?;

    let fabric = Arc::new(ConnectionFabric::new());

    let messager =
        WebhookMessager::new(config.webhook_url.clone(), &config.chain_name, args.notify);
    messager.notify("engine started").await;

    // First fatal error from any component tears the engine down.
    let (quit_tx, mut quit_rx) = mpsc::channel::<eyre::Report>(8);

    // user operation queue
    let (queue, mut queue_errors) = Service::new("userop", DEFAULT_MAX_RETRIES, args.queue_buffer);
    {
        let messager = messager.clone();
        tokio::spawn(async move {
            while let Some(err) = queue_errors.recv().await {
                error!(error = %err, "userop queue error");
                messager.notify_error(&err).await;
            }
        });
    }
    {
        let processor =
            Arc::new(UserOpProcessor::new(store.clone(), chain.clone(), fabric.clone()));
        let queue = queue.clone();
        let cancel = cancel.clone();
        let quit = quit_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = queue.start(processor, cancel).await {
                let _ = quit.send(err).await;
            }
        });
    }

    // indexer
    if args.no_index {
        info!("indexing disabled");
    } else {
        match subscriber {
            Some(subscriber) => {
                let indexer =
                    Indexer::new(store.clone(), chain.clone(), subscriber, fabric.clone());
                let cancel = cancel.clone();
                let quit = quit_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = indexer.start(cancel).await {
                        let _ = quit.send(err).await;
                    }
                });
            }
            None => warn!("indexing disabled: polling mode has no streaming transport"),
        }
    }

    // timeout reconciler
    {
        let reconciler = TimeoutReconciler::new(store.clone(), chain.clone());
        let cancel = cancel.clone();
        let quit = quit_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = reconciler.start(cancel).await {
                let _ = quit.send(err).await;
            }
        });
    }

    // json-rpc server, with unregistered methods proxied to the chain
    let mut rpc = JsonRpcServer::new(args.rpc_addr, args.rpc_port)
        .with_cors(&args.cors_domain)
        .with_proxy(config.rpc_url.clone());
    rpc.add_methods(
        EthApiServerImpl { store: store.clone(), chain: chain.clone(), queue: queue.clone() }
            .into_rpc(),
    )?;
    rpc.add_methods(
        PaymasterApiServerImpl { store: store.clone(), chain: chain.clone() }.into_rpc(),
    )?;
    let _rpc_handle = rpc.start().await?;
    info!(addr = %args.rpc_addr, port = args.rpc_port, "rpc server listening");

    // rest + websocket api
    {
        let state = Arc::new(ApiState { store: store.clone(), fabric: fabric.clone() });
        let addr = SocketAddr::new(args.api_addr, args.api_port);
        let quit = quit_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(addr, state).await {
                let _ = quit.send(err).await;
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        Some(err) = quit_rx.recv() => {
            error!(error = %err, "engine component failed");
            messager.notify_error(&err).await;
            cancel.cancel();
            return Err(err);
        }
    }

    cancel.cancel();
    messager.notify("engine stopped").await;

    Ok(())
}
