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
/// bcvi is a back-channel command proxy for ssh sessions: commands
/// run on the remote host (open a file in an editor, copy a file to
/// the desktop) are forwarded back to the originating workstation
/// and executed there.
use clap::Parser;

fn main() -> anyhow::Result<()> {
    // usage errors exit 1, like every other bcvi failure; clap
    // would exit 2 on its own
    let args = libbcvi::Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    libbcvi::run(args, None)
}
