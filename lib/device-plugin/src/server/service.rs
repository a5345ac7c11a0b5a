// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `v1beta1.DevicePlugin` gRPC service.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::MpsConfig;

use super::allocate::{container_grant, preferred_allocation};
use super::proto::{
    device_plugin_server::DevicePlugin, AllocateRequest, AllocateResponse,
    ContainerPreferredAllocationResponse, Device, DevicePluginOptions, Empty,
    ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use super::table::DeviceTable;

pub(crate) fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}

#[derive(Clone)]
pub(crate) struct DevicePluginService {
    table: Arc<DeviceTable>,
    mps: MpsConfig,
}

impl DevicePluginService {
    pub(crate) fn new(table: Arc<DeviceTable>, mps: MpsConfig) -> Self {
        Self { table, mps }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        tracing::debug!(devices = self.table.len(), "New ListAndWatch stream");

        let snapshots = UnboundedReceiverStream::new(self.table.subscribe());
        let stream = snapshots.map(|snapshot| {
            Ok(ListAndWatchResponse {
                devices: snapshot.iter().map(Device::from).collect(),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let container_responses = request
            .into_inner()
            .container_requests
            .into_iter()
            .map(|req| {
                let size = usize::try_from(req.allocation_size).unwrap_or(0);
                ContainerPreferredAllocationResponse {
                    device_ids: preferred_allocation(
                        &req.available_device_ids,
                        &req.must_include_device_ids,
                        size,
                    ),
                }
            })
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let mut container_responses = Vec::new();
        for req in request.into_inner().container_requests {
            match container_grant(&self.table, &req.devices_ids, &self.mps) {
                Ok(grant) => {
                    tracing::info!(devices = ?req.devices_ids, "Allocated virtual devices");
                    container_responses.push(grant);
                }
                Err(e) => {
                    tracing::warn!(error = %e, devices = ?req.devices_ids, "Rejecting allocation");
                    return Err(e.into());
                }
            }
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
