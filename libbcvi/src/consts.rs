// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// The environment variable carrying the connection descriptor on the
// remote host: "alias:gateway:port:auth_key". Its presence is what
// switches the remote shell aliases into bcvi mode.
pub const BCVI_CONF_VAR: &str = "BCVI_CONF";

pub const TERM_VAR: &str = "TERM";
pub const PAGER_VAR: &str = "PAGER";

// One-line state files under ~/.config/bcvi.
pub const LISTENER_KEY_FILE: &str = "listener_key";
pub const LISTENER_PORT_FILE: &str = "listener_port";
pub const LISTENER_PID_FILE: &str = "listener_pid";

pub const DEFAULT_EDITOR: &str = "gvim";
pub const DEFAULT_SCP: &str = "scp";
pub const DEFAULT_PAGER: &str = "less";
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";

// Markers delimiting the alias block bcvi maintains in shell rc
// files. Remote deployments grep for these exact lines, so they
// must never change.
pub const ALIASES_START: &str = "## START-BCVI";
pub const ALIASES_END: &str = "## END-BCVI";
