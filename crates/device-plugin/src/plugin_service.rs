//! kubelet facing gRPC surface of the device plugin.
//!
//! [`PluginService`] answers the `v1beta1.DevicePlugin` RPCs from the shared
//! [`DeviceInventory`]; [`ServeCycle`] owns one bound socket plus the tonic
//! server running on it; [`register_with_kubelet`] performs the registration
//! handshake.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use api_types::v1beta1;
use api_types::v1beta1::device_plugin_client::DevicePluginClient;
use api_types::v1beta1::device_plugin_server::DevicePlugin;
use api_types::v1beta1::device_plugin_server::DevicePluginServer;
use api_types::v1beta1::registration_client::RegistrationClient;
use api_types::v1beta1::AllocateRequest;
use api_types::v1beta1::AllocateResponse;
use api_types::v1beta1::ContainerAllocateResponse;
use api_types::v1beta1::DevicePluginOptions;
use api_types::v1beta1::Empty;
use api_types::v1beta1::ListAndWatchResponse;
use api_types::v1beta1::PreStartContainerRequest;
use api_types::v1beta1::PreStartContainerResponse;
use api_types::v1beta1::PreferredAllocationRequest;
use api_types::v1beta1::PreferredAllocationResponse;
use api_types::v1beta1::RegisterRequest;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Server;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::PluginError;
use crate::error::PluginResult;
use crate::inventory::DeviceInventory;
use crate::types::MountSpec;

/// Options announced at registration and through `GetDevicePluginOptions`.
pub fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// DevicePlugin service implementation for one serve cycle
#[derive(Debug)]
pub struct PluginService {
    inventory: Arc<DeviceInventory>,
    mounts: Arc<[MountSpec]>,
    /// cancelled when the serve cycle is torn down; ends open watch streams
    shutdown: CancellationToken,
}

impl PluginService {
    pub fn new(
        inventory: Arc<DeviceInventory>,
        mounts: Arc<[MountSpec]>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            mounts,
            shutdown,
        }
    }

    async fn current_devices(inventory: &DeviceInventory) -> Vec<v1beta1::Device> {
        inventory
            .devices()
            .await
            .iter()
            .map(v1beta1::Device::from)
            .collect()
    }
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Sends the device list, then again after every inventory change, until
    /// the serve cycle ends.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let inventory = self.inventory.clone();
        let shutdown = self.shutdown.clone();
        let mut revisions = inventory.subscribe();

        let stream = async_stream::stream! {
            loop {
                let devices = Self::current_devices(&inventory).await;
                debug!(count = devices.len(), "sending device list");
                let response: Result<ListAndWatchResponse, Status> =
                    Ok(ListAndWatchResponse { devices });
                yield response;

                select! {
                    _ = shutdown.cancelled() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("device watch stream stopped");
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    /// Resolves every requested device; any unknown or unhealthy id fails the
    /// whole request.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let mut container_responses = Vec::with_capacity(req.container_requests.len());

        for container_req in req.container_requests {
            info!(
                "allocating devices to container, device IDs: {:?}",
                container_req.devices_ids
            );

            let specs = self
                .inventory
                .device_specs(&container_req.devices_ids)
                .await
                .map_err(|report| {
                    warn!("rejecting allocation: {report:?}");
                    Status::invalid_argument(report.current_context().to_string())
                })?;

            container_responses.push(ContainerAllocateResponse {
                envs: HashMap::new(),
                mounts: self.mounts.iter().map(v1beta1::Mount::from).collect(),
                devices: specs.into_iter().map(v1beta1::DeviceSpec::from).collect(),
                annotations: HashMap::new(),
                cdi_devices: Vec::new(),
            });
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// One bound plugin socket and the gRPC server answering on it.
#[derive(Debug)]
pub struct ServeCycle {
    endpoint: PathBuf,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ServeCycle {
    /// Binds `endpoint` and spawns the gRPC server on it.
    pub fn start(
        endpoint: PathBuf,
        inventory: Arc<DeviceInventory>,
        mounts: Arc<[MountSpec]>,
    ) -> PluginResult<Self> {
        let bind_error = || PluginError::Bind {
            path: endpoint.display().to_string(),
        };

        // a leftover socket from a crashed run would make bind fail
        if endpoint.exists() {
            std::fs::remove_file(&endpoint).change_context_lazy(bind_error)?;
        }
        let listener = UnixListener::bind(&endpoint).change_context_lazy(bind_error)?;
        info!("starting device-plugin server at: {}", endpoint.display());

        let shutdown = CancellationToken::new();
        let service = DevicePluginServer::new(PluginService::new(
            inventory,
            mounts,
            shutdown.clone(),
        ));

        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    signal.cancelled().await;
                })
                .await
        });

        Ok(Self {
            endpoint,
            shutdown,
            server,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// File name of the socket, as announced to the kubelet.
    pub fn endpoint_name(&self) -> String {
        self.endpoint
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Polls the socket until the server answers `GetDevicePluginOptions`.
    pub async fn wait_until_serving(&self, poll_interval: Duration) -> PluginResult<()> {
        loop {
            if self.server.is_finished() {
                return Err(Report::new(PluginError::Serve {
                    message: "server exited before it started serving".to_string(),
                }));
            }

            match connect_uds(&self.endpoint).await {
                Ok(channel) => {
                    let mut client = DevicePluginClient::new(channel);
                    match client.get_device_plugin_options(Empty {}).await {
                        Ok(_) => return Ok(()),
                        Err(status) => debug!("device plugin server not ready: {status}"),
                    }
                }
                Err(e) => debug!("device plugin server not reachable yet: {e}"),
            }

            sleep(poll_interval).await;
        }
    }

    /// Stops the server and waits until its task has finished.
    pub async fn shutdown(self) {
        info!("stopping device-plugin server at: {}", self.endpoint.display());
        self.shutdown.cancel();
        match self.server.await {
            Ok(Ok(())) => info!("device-plugin server stopped"),
            Ok(Err(e)) => error!("device-plugin server stopped serving: {e}"),
            Err(e) => error!("device-plugin server task failed: {e}"),
        }
    }
}

/// Sends the registration request for `endpoint_name` to the kubelet.
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    endpoint_name: &str,
    resource_name: &str,
) -> PluginResult<()> {
    info!("registering device plugin with kubelet: {}", kubelet_socket.display());
    let registration_error = || PluginError::Registration {
        socket: kubelet_socket.display().to_string(),
    };

    let channel = connect_uds(kubelet_socket)
        .await
        .change_context_lazy(registration_error)?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: api_types::VERSION.to_string(),
        endpoint: endpoint_name.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(plugin_options()),
    };

    client
        .register(Request::new(request))
        .await
        .change_context_lazy(registration_error)
        .attach_printable_lazy(|| format!("resource name: {resource_name}"))?;

    info!(resource_name, endpoint = endpoint_name, "registered device plugin with kubelet");
    Ok(())
}

/// create Unix Domain Socket client connection
pub async fn connect_uds(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // The URI is a placeholder, the connector always dials the socket.
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(socket_path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
}
